//! ChickadeeFS storage core.
//!
//! A journaled, block-based teaching filesystem: fixed 4 KiB blocks, a
//! single root directory, direct/indirect/indirect2 file maps, and a
//! write-ahead journal replayed at mount for crash consistency.
//!
//! The crate splits into the on-line core under [`fs`] (layout, journal
//! replay, buffer cache, file iterator, mounted-state façade) and the
//! offline tools ([`mkfs`] builds images, [`check`] verifies them),
//! which also back the `mkchickadeefs` and `chickadeefsck` binaries.

#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod macros;

pub mod check;
pub mod crc;
pub mod errors;
pub mod fs;
pub mod mkfs;
