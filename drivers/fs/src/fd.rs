//! File Descriptor Management
//!
//! The fixed-size open-file table behind the descriptor API.

use crate::vnode::Vnode;
use crate::{FsError, OpenMode};

use std::sync::Arc;

/// File descriptor type
pub type Fd = i32;

/// Maximum number of simultaneously open files
pub const MAX_OPEN_FILES: usize = 24;

/// An open file: vnode, open mode and stream position
#[derive(Debug)]
pub struct OpenFile {
    pub vnode: Arc<Vnode>,
    pub mode: OpenMode,
    pub position: u64,
}

/// Fixed-size open-file table. A free slot holds `None`; a descriptor is
/// the index of its slot.
pub struct FdTable {
    entries: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl FdTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| None),
        }
    }

    /// Record an open file in the first free slot
    pub fn allocate(&mut self, vnode: Arc<Vnode>, mode: OpenMode) -> Result<Fd, FsError> {
        let slot = self
            .entries
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(FsError::TooManyOpenFiles)?;

        self.entries[slot] = Some(OpenFile {
            vnode,
            mode,
            position: 0,
        });
        Ok(slot as Fd)
    }

    /// Free a slot, returning its entry
    pub fn release(&mut self, fd: Fd) -> Result<OpenFile, FsError> {
        let slot = self.slot(fd)?;
        self.entries[slot].take().ok_or(FsError::BadDescriptor)
    }

    /// Get the open file behind a descriptor
    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, FsError> {
        let slot = self.slot(fd)?;
        self.entries[slot].as_mut().ok_or(FsError::BadDescriptor)
    }

    fn slot(&self, fd: Fd) -> Result<usize, FsError> {
        if fd < 0 || fd as usize >= MAX_OPEN_FILES {
            return Err(FsError::BadDescriptor);
        }
        Ok(fd as usize)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
