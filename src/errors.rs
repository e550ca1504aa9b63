//! Error types shared across the storage core.
//!
//! Every error enum in the crate implements [`BaseError`], a small common
//! trait that makes errors composable behind trait objects. Fallible
//! functions that return nothing use the [`CanFail`] alias.

use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in
/// this crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are
/// dealing with errors. Foreign error types that cross our boundaries (host
/// I/O errors, mostly) implement it as well.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Result alias for device-level I/O paths.
pub type IoResult<T> = Result<T, IoError>;

/// Result alias for filesystem-level operations.
pub type FsResult<T> = Result<T, FsError>;

/// `IoError` defines the error types raised by block devices.
///
/// The disk contract only accepts transfers whose size and byte offset are
/// multiples of the sector size; everything else is an invalid command.
#[derive(Debug)]
pub enum IoError {
    /// Transfer size or offset not a multiple of the sector size.
    Misaligned,

    /// Transfer extends past the end of the device.
    OutOfBounds,

    /// The device rejected or failed the command.
    Exception(Box<dyn BaseError + Send + Sync>),

    Unknown,
}

impl BaseError for IoError {}

impl BaseError for std::io::Error {}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::Exception(Box::new(err))
    }
}

/// `FsError` defines the error types raised by the filesystem layers above
/// the raw device: the buffer cache, the iterator, the façade and the
/// offline tools.
#[derive(Debug)]
pub enum FsError {
    /// Superblock magic or geometry is invalid.
    BadSuperblock,

    /// The journal carries an inconsistency the replayer refuses to apply.
    BadJournal,

    /// Out of data blocks, or no free run of the requested length.
    NoSpace,

    /// Out of inodes (builder only).
    NoInode,

    /// Every buffer-cache slot is busy.
    CacheFull,

    /// Directory lookup miss.
    NotFound,

    /// File offset past the largest representable file.
    FileTooBig,

    /// Malformed or reserved name, or name longer than the dirent field.
    BadName,

    /// A parameter that does not fit the on-disk format.
    InvalidArgument,

    /// Device-level failure underneath a filesystem operation.
    Io(IoError),
}

impl BaseError for FsError {}

impl From<IoError> for FsError {
    fn from(err: IoError) -> Self {
        FsError::Io(err)
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(IoError::from(err))
    }
}
