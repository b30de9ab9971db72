//! Filesystem Support
//!
//! The VFS dispatch layer and the filesystem drivers behind it.

pub mod fat12;
pub mod fd;
pub mod ramfs;
pub mod vfs;
pub mod vnode;

#[cfg(test)]
mod testutil;

use bitflags::bitflags;
use core::fmt;
use vfsim_block::DeviceError;

/// Filesystem error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Generic failure
    Generic,
    /// File or directory not found
    NotFound,
    /// File or directory already exists
    Exists,
    /// Operation not permitted on this descriptor or mount
    AccessDenied,
    /// Vnode cache exhausted with every slot pinned
    OutOfMemory,
    /// Path is a directory (file expected)
    IsADirectory,
    /// Path is not a directory
    NotADirectory,
    /// Open-file table is full
    TooManyOpenFiles,
    /// Descriptor does not refer to an open file
    BadDescriptor,
    /// Device-level I/O failure
    Io,
}

impl FsError {
    /// Signed error code, for callers that keep the classic C surface
    pub fn code(self) -> i32 {
        match self {
            FsError::Generic | FsError::Io => -1,
            FsError::NotFound => -2,
            FsError::Exists => -3,
            FsError::AccessDenied => -4,
            FsError::OutOfMemory => -5,
            FsError::IsADirectory => -9,
            FsError::NotADirectory => -10,
            FsError::TooManyOpenFiles => -11,
            FsError::BadDescriptor => -12,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Generic => write!(f, "operation failed"),
            FsError::NotFound => write!(f, "file or directory not found"),
            FsError::Exists => write!(f, "file or directory already exists"),
            FsError::AccessDenied => write!(f, "permission denied"),
            FsError::OutOfMemory => write!(f, "vnode cache exhausted"),
            FsError::IsADirectory => write!(f, "is a directory"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::TooManyOpenFiles => write!(f, "too many open files"),
            FsError::BadDescriptor => write!(f, "invalid file descriptor"),
            FsError::Io => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<DeviceError> for FsError {
    fn from(_: DeviceError) -> Self {
        FsError::Io
    }
}

bitflags! {
    /// Descriptor open mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u16 {
        /// Open for reading
        const RDONLY = 0x0001;
        /// Open for writing
        const WRONLY = 0x0002;
        /// Open for reading and writing
        const RDWR = 0x0003;
    }
}

impl OpenMode {
    /// Check whether reads are permitted in this mode
    pub fn readable(self) -> bool {
        self.contains(OpenMode::RDONLY)
    }

    /// Check whether writes are permitted in this mode
    pub fn writable(self) -> bool {
        self.contains(OpenMode::WRONLY)
    }
}
