//! VFS dispatch
//!
//! The mount table, cross-mount path resolution and the descriptor API.
//! All world state lives in one [`Vfs`] context passed explicitly by the
//! caller; operations are strictly serialized on the caller's thread.

use crate::fd::{Fd, FdTable};
use crate::vnode::Vnode;
use crate::{FsError, OpenMode};

use std::sync::Arc;
use vfsim_block::{BlockDevice, DeviceRegistry};

/// Maximum number of registered filesystem drivers
pub const MAX_FILESYSTEMS: usize = 10;

/// A registered filesystem driver
pub trait Filesystem: Send + Sync {
    /// Driver name used to select it in [`Vfs::mount`]
    fn fs_name(&self) -> &str;

    /// Build a volume over the given device. `device` is the registry entry
    /// for `device_id` when one exists; drivers that need no block device
    /// ignore it.
    fn mount(
        &self,
        device_id: usize,
        device: Option<Arc<dyn BlockDevice>>,
    ) -> Result<Arc<dyn Volume>, FsError>;
}

/// A mounted filesystem instance
pub trait Volume: Send + Sync {
    /// The volume's root directory
    fn root(&self) -> Arc<Vnode>;

    /// Release driver state (vnode caches, buffers)
    fn unmount(&self);
}

fn same_volume(a: &Arc<dyn Volume>, b: &Arc<dyn Volume>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// One entry in the mount list
struct Mount {
    path: String,
    fs_name: String,
    device_id: usize,
    volume: Arc<dyn Volume>,
    /// Vnode of the parent filesystem this mount covers; `None` for the
    /// root mount
    covered: Option<Arc<Vnode>>,
}

/// The VFS context: driver registry, device table, mount list and the
/// open-file table
pub struct Vfs {
    filesystems: Vec<Arc<dyn Filesystem>>,
    devices: DeviceRegistry,
    mounts: Vec<Mount>,
    open_files: FdTable,
}

impl Vfs {
    /// Create a context with empty registries
    pub fn new() -> Self {
        Self {
            filesystems: Vec::new(),
            devices: DeviceRegistry::new(),
            mounts: Vec::new(),
            open_files: FdTable::new(),
        }
    }

    /// Get the device registry
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Get the device registry for registration
    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }

    /// Register a filesystem driver. The first registration of a name wins
    /// on lookup.
    pub fn register_filesystem(&mut self, fs: Arc<dyn Filesystem>) -> Result<(), FsError> {
        if self.filesystems.len() >= MAX_FILESYSTEMS {
            return Err(FsError::Generic);
        }
        log::info!("registered filesystem driver {}", fs.fs_name());
        self.filesystems.push(fs);
        Ok(())
    }

    fn find_filesystem(&self, name: &str) -> Option<Arc<dyn Filesystem>> {
        self.filesystems
            .iter()
            .find(|fs| fs.fs_name() == name)
            .cloned()
    }

    /// Mount points in mount order, as (path, driver name) pairs
    pub fn mount_points(&self) -> Vec<(String, String)> {
        self.mounts
            .iter()
            .map(|mount| (mount.path.clone(), mount.fs_name.clone()))
            .collect()
    }

    /// Resolve an absolute path to a vnode, crossing mount boundaries.
    ///
    /// Before each component is looked up, covering mounts on the current
    /// node are chased so the walk descends into the innermost mounted
    /// volume. The final vnode is returned as the outer filesystem sees it,
    /// which is what `unmount` needs.
    pub fn lookup_path(&self, path: &str) -> Result<Arc<Vnode>, FsError> {
        if !path.starts_with('/') {
            return Err(FsError::NotFound);
        }

        let root_mount = self.mounts.first().ok_or(FsError::NotFound)?;
        let mut node = root_mount.volume.root();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            while let Some(volume) = node.mounted_here() {
                node = volume.root();
            }
            node = node.ops().lookup(component)?;
        }

        Ok(node)
    }

    /// Mount the named filesystem at `mount_point`, backed by `device_id`.
    ///
    /// The first mount becomes the root mount; its mount point is forced to
    /// `/`. Later mounts cover the vnode their mount point resolves to.
    pub fn mount(
        &mut self,
        fs_name: &str,
        mount_point: &str,
        device_id: usize,
    ) -> Result<(), FsError> {
        let fs = self.find_filesystem(fs_name).ok_or(FsError::Generic)?;

        let covered = if self.mounts.is_empty() {
            None
        } else {
            Some(self.lookup_path(mount_point)?)
        };

        let device = self.devices.get(device_id);
        let volume = fs.mount(device_id, device)?;

        let path = match covered {
            None => "/",
            Some(_) => mount_point,
        };

        if let Some(ref covered) = covered {
            covered.grab();
            covered.set_mounted_here(volume.clone());
        }

        log::info!("mounted {} at {} (device {})", fs_name, path, device_id);
        self.mounts.push(Mount {
            path: path.to_string(),
            fs_name: fs_name.to_string(),
            device_id,
            volume,
            covered,
        });
        Ok(())
    }

    /// Unmount the filesystem covering `mount_point`.
    ///
    /// Refused for the root mount and while other mounts are still stacked
    /// on top of this one.
    pub fn unmount(&mut self, mount_point: &str) -> Result<(), FsError> {
        let covered = self.lookup_path(mount_point)?;
        let volume = covered.mounted_here().ok_or(FsError::Generic)?;

        let index = self
            .mounts
            .iter()
            .position(|mount| same_volume(&mount.volume, &volume))
            .ok_or(FsError::Generic)?;
        if index == 0 {
            return Err(FsError::AccessDenied);
        }
        if self.has_stacked_mounts(&volume) {
            return Err(FsError::AccessDenied);
        }

        let mount = self.mounts.remove(index);
        mount.volume.unmount();
        covered.clear_mounted_here();
        covered.release();

        log::info!("unmounted {} (device {})", mount.path, mount.device_id);
        Ok(())
    }

    /// Check whether any mount in the list covers a vnode that belongs to
    /// `volume` or to a volume mounted somewhere below it.
    fn has_stacked_mounts(&self, volume: &Arc<dyn Volume>) -> bool {
        let mut subtree: Vec<Arc<dyn Volume>> = vec![volume.clone()];
        let mut index = 0;

        while index < subtree.len() {
            for mount in &self.mounts {
                let covered_owner = mount
                    .covered
                    .as_ref()
                    .and_then(|covered| covered.owner());
                if let Some(owner) = covered_owner {
                    if same_volume(&owner, &subtree[index])
                        && !subtree.iter().any(|v| same_volume(v, &mount.volume))
                    {
                        subtree.push(mount.volume.clone());
                    }
                }
            }
            index += 1;
        }

        subtree.len() > 1
    }

    /// Open the file at `path` and return its descriptor
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<Fd, FsError> {
        let vnode = self.lookup_path(path)?;
        let fd = self.open_files.allocate(vnode.clone(), mode)?;
        vnode.grab();
        Ok(fd)
    }

    /// Close a descriptor
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let entry = self.open_files.release(fd)?;
        entry.vnode.release();
        Ok(())
    }

    /// Read from a descriptor at its current position, advancing it by the
    /// bytes produced
    pub fn read(&mut self, fd: Fd, buffer: &mut [u8]) -> Result<usize, FsError> {
        let file = self.open_files.get_mut(fd)?;
        if !file.mode.readable() {
            return Err(FsError::AccessDenied);
        }

        let produced = file.vnode.ops().read(buffer, file.position)?;
        file.position += produced as u64;
        Ok(produced)
    }

    /// Write to a descriptor at its current position, advancing it by the
    /// bytes consumed
    pub fn write(&mut self, fd: Fd, buffer: &[u8]) -> Result<usize, FsError> {
        let file = self.open_files.get_mut(fd)?;
        if !file.mode.writable() {
            return Err(FsError::AccessDenied);
        }

        let consumed = file.vnode.ops().write(buffer, file.position)?;
        file.position += consumed as u64;
        Ok(consumed)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat12::Fat12Fs;
    use crate::fd::MAX_OPEN_FILES;
    use crate::ramfs::{RamFs, TreeNode};
    use crate::testutil::{fat12_image, FatFile, MemDevice};

    /// A world with one FAT12 disk mounted at `/`.
    ///
    /// The image holds `/HI.TXT` ("hello from disk0!"), `/TINY.TXT`
    /// (5 bytes) and `/MYDIR/MSG.TXT` ("nested").
    fn fat_world() -> Vfs {
        let image = fat12_image(&[
            FatFile::file("hi.txt", b"hello from disk0!"),
            FatFile::file("tiny.txt", b"12345"),
            FatFile::dir("mydir", &[FatFile::file("msg.txt", b"nested")]),
        ]);

        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(Fat12Fs)).unwrap();
        vfs.devices_mut().add_device(Arc::new(MemDevice::new(image)));
        vfs.mount("fat12", "/", 0).unwrap();
        vfs
    }

    #[test]
    fn reads_a_file_in_the_root_directory() {
        let mut vfs = fat_world();

        let fd = vfs.open("/hi.txt", OpenMode::RDWR).unwrap();
        assert_eq!(fd, 0);

        let mut buffer = [0u8; 17];
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 17);
        assert_eq!(&buffer, b"hello from disk0!");
    }

    #[test]
    fn reads_a_file_in_a_sub_directory() {
        let mut vfs = fat_world();

        let fd = vfs.open("/mydir/msg.txt", OpenMode::RDONLY).unwrap();
        let mut buffer = [0u8; 6];
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 6);
        assert_eq!(&buffer, b"nested");
    }

    #[test]
    fn short_read_then_eof_as_position_advances() {
        let mut vfs = fat_world();

        let fd = vfs.open("/tiny.txt", OpenMode::RDONLY).unwrap();
        let mut buffer = [0u8; 100];
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"12345");
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn chunked_reads_advance_through_the_file() {
        let mut vfs = fat_world();

        let fd = vfs.open("/hi.txt", OpenMode::RDONLY).unwrap();
        let mut collected = Vec::new();
        let mut chunk = [0u8; 9];
        loop {
            let produced = vfs.read(fd, &mut chunk).unwrap();
            if produced == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..produced]);
        }
        assert_eq!(collected, b"hello from disk0!");
    }

    #[test]
    fn error_surface_matches_the_classic_codes() {
        let mut vfs = fat_world();

        let missing = vfs.open("/does/not/exist", OpenMode::RDONLY).unwrap_err();
        assert_eq!(missing.code(), -2);

        let mut buffer = [0u8; 1];
        let bad_fd = vfs.read(999, &mut buffer).unwrap_err();
        assert_eq!(bad_fd.code(), -12);

        let fd = vfs.open("/hi.txt", OpenMode::RDONLY).unwrap();
        let denied = vfs.write(fd, b"x").unwrap_err();
        assert_eq!(denied.code(), -4);

        let fd = vfs.open("/hi.txt", OpenMode::WRONLY).unwrap();
        let denied = vfs.read(fd, &mut buffer).unwrap_err();
        assert_eq!(denied.code(), -4);
    }

    #[test]
    fn read_after_close_is_a_bad_descriptor() {
        let mut vfs = fat_world();

        let fd = vfs.open("/hi.txt", OpenMode::RDONLY).unwrap();
        vfs.close(fd).unwrap();

        let mut buffer = [0u8; 1];
        assert_eq!(vfs.read(fd, &mut buffer), Err(FsError::BadDescriptor));
        assert_eq!(vfs.close(fd), Err(FsError::BadDescriptor));
    }

    #[test]
    fn open_close_leaves_the_reference_count_unchanged() {
        let mut vfs = fat_world();

        let node = vfs.lookup_path("/hi.txt").unwrap();
        let before = node.ref_count();

        for _ in 0..3 {
            let fd = vfs.open("/hi.txt", OpenMode::RDONLY).unwrap();
            vfs.close(fd).unwrap();
        }

        assert_eq!(node.ref_count(), before);
    }

    #[test]
    fn descriptor_table_fills_at_capacity() {
        let mut vfs = fat_world();

        for _ in 0..MAX_OPEN_FILES {
            vfs.open("/hi.txt", OpenMode::RDONLY).unwrap();
        }
        assert_eq!(
            vfs.open("/hi.txt", OpenMode::RDONLY),
            Err(FsError::TooManyOpenFiles)
        );
    }

    #[test]
    fn paths_resolve_across_mount_boundaries() {
        let mut vfs = fat_world();

        let ramfs = Arc::new(RamFs::new());
        let tree = TreeNode::dir("/");
        TreeNode::add_child(&tree, TreeNode::file("x.txt", b"inner")).unwrap();
        ramfs.seed_tree(7, tree);
        vfs.register_filesystem(ramfs).unwrap();

        vfs.mount("ramfs", "/mydir", 7).unwrap();

        // The walk must land in the inner filesystem, not the outer one.
        let mut buffer = [0u8; 5];
        let fd = vfs.open("/mydir/x.txt", OpenMode::RDONLY).unwrap();
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"inner");
        assert_eq!(
            vfs.open("/mydir/msg.txt", OpenMode::RDONLY),
            Err(FsError::NotFound)
        );

        // Same vnode whether reached through the path walk or directly
        // through the mounted volume's root.
        let via_walk = vfs.lookup_path("/mydir/x.txt").unwrap();
        let covered = vfs.lookup_path("/mydir").unwrap();
        let inner_root = covered.mounted_here().unwrap().root();
        let direct = inner_root.ops().lookup("x.txt").unwrap();
        assert!(Arc::ptr_eq(&via_walk, &direct));
    }

    #[test]
    fn unmount_restores_the_covered_directory() {
        let mut vfs = fat_world();

        let ramfs = Arc::new(RamFs::new());
        let tree = TreeNode::dir("/");
        TreeNode::add_child(&tree, TreeNode::file("x.txt", b"inner")).unwrap();
        ramfs.seed_tree(0, tree);
        vfs.register_filesystem(ramfs).unwrap();

        let covered = vfs.lookup_path("/mydir").unwrap();
        let refs_before = covered.ref_count();

        vfs.mount("ramfs", "/mydir", 0).unwrap();
        assert_eq!(covered.ref_count(), refs_before + 1);

        vfs.unmount("/mydir").unwrap();
        assert_eq!(covered.ref_count(), refs_before);

        // The outer directory's contents are visible again.
        let mut buffer = [0u8; 6];
        let fd = vfs.open("/mydir/msg.txt", OpenMode::RDONLY).unwrap();
        assert_eq!(vfs.read(fd, &mut buffer).unwrap(), 6);
        assert_eq!(&buffer, b"nested");
    }

    #[test]
    fn unmount_guards() {
        let mut vfs = fat_world();

        // Not a mount point.
        assert_eq!(vfs.unmount("/mydir"), Err(FsError::Generic));
        // The root mount's own root is never covered, so it fails the
        // mount-point check before anything else.
        assert_eq!(vfs.unmount("/"), Err(FsError::Generic));

        // A mount with another mount stacked on top cannot go away either.
        let ramfs = Arc::new(RamFs::new());
        let outer = TreeNode::dir("/");
        TreeNode::add_child(&outer, TreeNode::dir("sub")).unwrap();
        ramfs.seed_tree(1, outer);
        ramfs.seed_tree(2, TreeNode::dir("/"));
        vfs.register_filesystem(ramfs).unwrap();

        vfs.mount("ramfs", "/mydir", 1).unwrap();
        vfs.mount("ramfs", "/mydir/sub", 2).unwrap();

        assert_eq!(vfs.unmount("/mydir"), Err(FsError::AccessDenied));

        vfs.unmount("/mydir/sub").unwrap();
        vfs.unmount("/mydir").unwrap();
    }

    #[test]
    fn unknown_driver_name_fails_the_mount() {
        let mut vfs = Vfs::new();
        assert_eq!(vfs.mount("nofs", "/", 0), Err(FsError::Generic));
    }

    #[test]
    fn driver_registry_is_bounded() {
        let mut vfs = Vfs::new();
        for _ in 0..MAX_FILESYSTEMS {
            vfs.register_filesystem(Arc::new(RamFs::new())).unwrap();
        }
        assert_eq!(
            vfs.register_filesystem(Arc::new(RamFs::new())),
            Err(FsError::Generic)
        );
    }

    #[test]
    fn mount_points_lists_in_mount_order() {
        let mut vfs = fat_world();
        let ramfs = Arc::new(RamFs::new());
        vfs.register_filesystem(ramfs).unwrap();
        vfs.mount("ramfs", "/mydir", 0).unwrap();

        let points = vfs.mount_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], ("/".to_string(), "fat12".to_string()));
        assert_eq!(points[1], ("/mydir".to_string(), "ramfs".to_string()));
    }
}
