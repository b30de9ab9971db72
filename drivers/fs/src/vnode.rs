//! Vnodes
//!
//! Filesystem-independent file identity. A vnode pairs VFS-visible state
//! (type, flags, reference count, covering mount) with a driver-owned
//! operation object that carries the driver's private payload.

use crate::vfs::Volume;
use crate::FsError;

use bitflags::bitflags;
use core::fmt;
use spin::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Vnode type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
}

bitflags! {
    /// Vnode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// This vnode is its volume's root directory
        const ROOT = 0x1;
    }
}

/// Driver-side vnode operations
///
/// The implementing object carries the driver's private payload: a copy of
/// the matched directory entry for FAT12, a tree node for ramfs.
pub trait VnodeOps: Send + Sync {
    /// Read at `offset`. Returns the bytes produced; 0 at end of file.
    fn read(&self, buffer: &mut [u8], offset: u64) -> Result<usize, FsError>;

    /// Write at `offset`. Returns the bytes consumed.
    fn write(&self, buffer: &[u8], offset: u64) -> Result<usize, FsError>;

    /// Look up a single path component in this directory
    fn lookup(&self, name: &str) -> Result<Arc<Vnode>, FsError>;
}

/// A filesystem-independent handle to a file or directory
pub struct Vnode {
    kind: VnodeKind,
    flags: VnodeFlags,
    ref_count: AtomicU32,
    /// Volume mounted atop this vnode, if any
    mounted_here: RwLock<Option<Arc<dyn Volume>>>,
    /// Volume this vnode belongs to. Weak: the mount table owns volumes,
    /// so tearing one down never has to chase vnode cycles.
    owner: Weak<dyn Volume>,
    ops: Box<dyn VnodeOps>,
}

impl Vnode {
    /// Create a vnode owned by `owner` with the given driver operations
    pub fn new(
        kind: VnodeKind,
        flags: VnodeFlags,
        owner: Weak<dyn Volume>,
        ops: Box<dyn VnodeOps>,
    ) -> Self {
        Self {
            kind,
            flags,
            ref_count: AtomicU32::new(0),
            mounted_here: RwLock::new(None),
            owner,
            ops,
        }
    }

    /// Get the vnode type
    pub fn kind(&self) -> VnodeKind {
        self.kind
    }

    /// Get the vnode flags
    pub fn flags(&self) -> VnodeFlags {
        self.flags
    }

    /// Get the current reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Take a reference (open, or being covered by a mount)
    pub fn grab(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference (close, or unmount)
    pub fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the volume mounted atop this vnode, if any
    pub fn mounted_here(&self) -> Option<Arc<dyn Volume>> {
        self.mounted_here.read().clone()
    }

    /// Cover this vnode with a mounted volume. At most one volume covers a
    /// vnode at a time; a second mount replaces the first.
    pub(crate) fn set_mounted_here(&self, volume: Arc<dyn Volume>) {
        *self.mounted_here.write() = Some(volume);
    }

    /// Remove the covering volume
    pub(crate) fn clear_mounted_here(&self) {
        *self.mounted_here.write() = None;
    }

    /// Get the owning volume, if it is still mounted
    pub fn owner(&self) -> Option<Arc<dyn Volume>> {
        self.owner.upgrade()
    }

    /// Get the driver operations
    pub fn ops(&self) -> &dyn VnodeOps {
        &*self.ops
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("ref_count", &self.ref_count())
            .field("covered", &self.mounted_here.read().is_some())
            .finish_non_exhaustive()
    }
}
