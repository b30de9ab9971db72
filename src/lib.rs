//! Vfsim
//!
//! User-space virtual filesystem core: a block-device layer over `.img`
//! files, a vnode-based VFS with cross-mount path resolution, a FAT12
//! driver and an in-memory ram filesystem.

pub use vfsim_block as block;
pub use vfsim_fs as fs;
