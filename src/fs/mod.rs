//! File-system related code.
//!
//! Contains the storage core proper: the on-disk layout ([`layout`]), the
//! write-ahead journal replayer ([`journal`]), the block buffer cache
//! ([`cache`]), the inode-indexed file iterator ([`iter`]) and the mounted
//! filesystem façade ([`state`]).
//!
//! The only thing this module asks of the outside world is a
//! [`BlockDevice`]: a blocking byte-addressed disk whose transfers are
//! sector-aligned. [`MemDisk`] and [`FileDisk`] cover the offline tools
//! and the test harness.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::errors::{CanFail, IoError, IoResult};

pub mod cache;
pub mod iter;
pub mod journal;
pub mod layout;
pub mod state;

/// Transfer granularity of the consumed disk contract.
///
/// Every `read`/`write` size and byte offset must be a multiple of this.
pub const SECTOR_SIZE: usize = 512;

/// A blocking block device.
///
/// This is the contract the storage core consumes from the disk driver:
/// `read(buf, off)` and `write(buf, off)` with `buf.len()` and `off`
/// multiples of [`SECTOR_SIZE`]. The driver blocks internally; the
/// filesystem treats each call as atomic.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes starting at byte offset `off`.
    ///
    /// # Errors
    ///
    /// [`IoError::Misaligned`] for unaligned transfers,
    /// [`IoError::OutOfBounds`] past the end of the device, or a
    /// device-specific failure.
    fn read(&self, buf: &mut [u8], off: u64) -> CanFail<IoError>;

    /// Writes `buf.len()` bytes starting at byte offset `off`.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`BlockDevice::read`].
    fn write(&self, buf: &[u8], off: u64) -> CanFail<IoError>;

    /// Device capacity in bytes.
    fn size(&self) -> u64;
}

fn check_alignment(len: usize, off: u64, size: u64) -> CanFail<IoError> {
    if len % SECTOR_SIZE != 0 || off % SECTOR_SIZE as u64 != 0 {
        return Err(IoError::Misaligned);
    }
    if off + len as u64 > size {
        return Err(IoError::OutOfBounds);
    }
    Ok(())
}

/// An in-memory block device.
///
/// Used by the offline tools (which operate on whole images) and by tests.
pub struct MemDisk {
    data: spin::RwLock<Vec<u8>>,
}

impl MemDisk {
    /// Wraps an image held in memory. The image length must be a multiple
    /// of [`SECTOR_SIZE`].
    pub fn new(data: Vec<u8>) -> IoResult<Self> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(IoError::Misaligned);
        }
        Ok(MemDisk {
            data: spin::RwLock::new(data),
        })
    }

    /// Consumes the disk and returns the backing image.
    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }

    /// Clones the current image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, buf: &mut [u8], off: u64) -> CanFail<IoError> {
        let data = self.data.read();
        check_alignment(buf.len(), off, data.len() as u64)?;
        let off = off as usize;
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, buf: &[u8], off: u64) -> CanFail<IoError> {
        let mut data = self.data.write();
        check_alignment(buf.len(), off, data.len() as u64)?;
        let off = off as usize;
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }
}

/// A block device backed by a host file.
pub struct FileDisk {
    file: Mutex<File>,
    size: u64,
}

impl FileDisk {
    /// Opens `file` as a disk. The file length must be a multiple of
    /// [`SECTOR_SIZE`].
    pub fn new(file: File) -> IoResult<Self> {
        let size = file.metadata().map_err(IoError::from)?.len();
        if size % SECTOR_SIZE as u64 != 0 {
            return Err(IoError::Misaligned);
        }
        Ok(FileDisk {
            file: Mutex::new(file),
            size,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read(&self, buf: &mut [u8], off: u64) -> CanFail<IoError> {
        check_alignment(buf.len(), off, self.size)?;
        let mut file = self.file.lock().expect("disk lock poisoned");
        file.seek(SeekFrom::Start(off)).map_err(IoError::from)?;
        file.read_exact(buf).map_err(IoError::from)
    }

    fn write(&self, buf: &[u8], off: u64) -> CanFail<IoError> {
        check_alignment(buf.len(), off, self.size)?;
        let mut file = self.file.lock().expect("disk lock poisoned");
        file.seek(SeekFrom::Start(off)).map_err(IoError::from)?;
        file.write_all(buf).map_err(IoError::from)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_rejects_unaligned_transfers() {
        let disk = MemDisk::new(vec![0; 4096]).unwrap();
        let mut buf = [0u8; 100];
        assert!(matches!(disk.read(&mut buf, 0), Err(IoError::Misaligned)));
        let mut buf = [0u8; 512];
        assert!(matches!(disk.read(&mut buf, 100), Err(IoError::Misaligned)));
        assert!(matches!(
            disk.read(&mut buf, 4096),
            Err(IoError::OutOfBounds)
        ));
    }

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(vec![0; 8192]).unwrap();
        let sector = [0xA5u8; 512];
        disk.write(&sector, 1024).unwrap();
        let mut back = [0u8; 512];
        disk.read(&mut back, 1024).unwrap();
        assert_eq!(back, sector);
    }
}
