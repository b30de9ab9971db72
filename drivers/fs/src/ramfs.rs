//! RamFS - Ram Filesystem (in-memory)
//!
//! A tree of in-memory nodes mountable as a filesystem. Trees are seeded
//! per device id before mounting, one backing tree per pseudo device, and
//! make a convenient second mount target next to disk-backed volumes.

use crate::vfs::{Filesystem, Volume};
use crate::vnode::{Vnode, VnodeFlags, VnodeKind, VnodeOps};
use crate::FsError;

use spin::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Vnode cache slots per mounted volume
const MAX_VNODES_PER_VOLUME: usize = 16;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Node type in a ram tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
}

/// Metadata carried by every tree node
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub create_time: u64,
    pub modify_time: u64,
    pub access_time: u64,
}

/// A node in an in-memory tree
pub struct TreeNode {
    meta: RwLock<NodeMeta>,
    data: RwLock<Vec<u8>>,
    children: RwLock<Vec<Arc<TreeNode>>>,
}

impl TreeNode {
    fn new(name: &str, node_type: NodeType) -> Arc<Self> {
        let created = now();
        Arc::new(Self {
            meta: RwLock::new(NodeMeta {
                name: name.to_string(),
                node_type,
                size: 0,
                create_time: created,
                modify_time: created,
                access_time: created,
            }),
            data: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    /// Create a directory node
    pub fn dir(name: &str) -> Arc<Self> {
        Self::new(name, NodeType::Directory)
    }

    /// Create a file node holding `contents`
    pub fn file(name: &str, contents: &[u8]) -> Arc<Self> {
        let node = Self::new(name, NodeType::File);
        *node.data.write() = contents.to_vec();
        node.meta.write().size = contents.len() as u64;
        node
    }

    /// Attach `child` under `parent`. Sibling names are unique.
    pub fn add_child(parent: &Arc<Self>, child: Arc<Self>) -> Result<(), FsError> {
        if parent.node_type() != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let name = child.meta.read().name.clone();
        if parent.find_child(&name).is_some() {
            return Err(FsError::Exists);
        }
        parent.children.write().push(child);
        parent.meta.write().modify_time = now();
        Ok(())
    }

    /// Get the node type
    pub fn node_type(&self) -> NodeType {
        self.meta.read().node_type
    }

    /// Get a copy of the metadata
    pub fn metadata(&self) -> NodeMeta {
        self.meta.read().clone()
    }

    fn find_child(&self, name: &str) -> Option<Arc<TreeNode>> {
        self.children
            .read()
            .iter()
            .find(|child| child.meta.read().name == name)
            .cloned()
    }

    fn read_at(&self, buffer: &mut [u8], offset: u64) -> Result<usize, FsError> {
        if self.node_type() != NodeType::File {
            return Err(FsError::IsADirectory);
        }
        self.meta.write().access_time = now();

        let data = self.data.read();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let take = buffer.len().min(data.len() - offset);
        buffer[..take].copy_from_slice(&data[offset..offset + take]);
        Ok(take)
    }

    fn write_at(&self, buffer: &[u8], offset: u64) -> Result<usize, FsError> {
        if self.node_type() != NodeType::File {
            return Err(FsError::IsADirectory);
        }

        let offset = offset as usize;
        let end = offset + buffer.len();
        let mut data = self.data.write();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buffer);

        let mut meta = self.meta.write();
        meta.size = meta.size.max(end as u64);
        let stamp = now();
        meta.modify_time = stamp;
        meta.access_time = stamp;
        Ok(buffer.len())
    }
}

struct CacheSlot {
    key: usize,
    node: Arc<Vnode>,
}

/// Fixed-size vnode cache keyed by tree-node identity
struct NodeCache {
    slots: [Option<CacheSlot>; MAX_VNODES_PER_VOLUME],
}

impl NodeCache {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    fn find(&self, key: usize) -> Option<Arc<Vnode>> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.key == key)
            .map(|slot| slot.node.clone())
    }

    fn insert(&mut self, key: usize, node: Arc<Vnode>) -> Result<(), FsError> {
        for slot in self.slots.iter_mut() {
            let usable = match slot {
                None => true,
                Some(occupied) => occupied.node.ref_count() == 0,
            };
            if usable {
                *slot = Some(CacheSlot { key, node });
                return Ok(());
            }
        }
        Err(FsError::OutOfMemory)
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

/// A mounted ram tree
pub struct RamVolume {
    cache: Mutex<NodeCache>,
    root: Arc<Vnode>,
}

impl RamVolume {
    /// Build a volume over a tree, with the tree's root as the root vnode
    pub fn mount_volume(tree: Arc<TreeNode>) -> Arc<Self> {
        Arc::new_cyclic(|volume: &Weak<RamVolume>| {
            let owner: Weak<dyn Volume> = volume.clone();
            let root = Arc::new(Vnode::new(
                VnodeKind::Directory,
                VnodeFlags::ROOT,
                owner,
                Box::new(RamNode {
                    volume: volume.clone(),
                    node: tree,
                }),
            ));
            Self {
                cache: Mutex::new(NodeCache::new()),
                root,
            }
        })
    }

    /// Return the cached vnode for a tree node, or build one and cache it
    fn node_for(self: &Arc<Self>, node: Arc<TreeNode>) -> Result<Arc<Vnode>, FsError> {
        let key = Arc::as_ptr(&node) as usize;
        let mut cache = self.cache.lock();
        if let Some(vnode) = cache.find(key) {
            return Ok(vnode);
        }

        let kind = match node.node_type() {
            NodeType::Directory => VnodeKind::Directory,
            NodeType::File => VnodeKind::Regular,
        };
        let owner: Weak<dyn Volume> = Arc::downgrade(&(self.clone() as Arc<dyn Volume>));
        let vnode = Arc::new(Vnode::new(
            kind,
            VnodeFlags::empty(),
            owner,
            Box::new(RamNode {
                volume: Arc::downgrade(self),
                node,
            }),
        ));

        cache.insert(key, vnode.clone())?;
        Ok(vnode)
    }
}

impl Volume for RamVolume {
    fn root(&self) -> Arc<Vnode> {
        self.root.clone()
    }

    fn unmount(&self) {
        self.cache.lock().clear();
    }
}

/// Driver payload behind each ramfs vnode
struct RamNode {
    volume: Weak<RamVolume>,
    node: Arc<TreeNode>,
}

impl VnodeOps for RamNode {
    fn read(&self, buffer: &mut [u8], offset: u64) -> Result<usize, FsError> {
        self.node.read_at(buffer, offset)
    }

    fn write(&self, buffer: &[u8], offset: u64) -> Result<usize, FsError> {
        self.node.write_at(buffer, offset)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Vnode>, FsError> {
        if self.node.node_type() != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        self.node.meta.write().access_time = now();

        let volume = self.volume.upgrade().ok_or(FsError::Generic)?;
        let child = self.node.find_child(name).ok_or(FsError::NotFound)?;
        volume.node_for(child)
    }
}

/// The registered ram filesystem driver. Trees to mount are seeded per
/// device id beforehand; an unseeded id mounts an empty root.
pub struct RamFs {
    seeds: RwLock<BTreeMap<usize, Arc<TreeNode>>>,
}

impl RamFs {
    /// Create a driver with no seeded trees
    pub fn new() -> Self {
        Self {
            seeds: RwLock::new(BTreeMap::new()),
        }
    }

    /// Associate a prebuilt tree with a device id
    pub fn seed_tree(&self, device_id: usize, root: Arc<TreeNode>) {
        self.seeds.write().insert(device_id, root);
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for RamFs {
    fn fs_name(&self) -> &str {
        "ramfs"
    }

    fn mount(
        &self,
        device_id: usize,
        _device: Option<Arc<dyn vfsim_block::BlockDevice>>,
    ) -> Result<Arc<dyn Volume>, FsError> {
        let tree = self
            .seeds
            .read()
            .get(&device_id)
            .cloned()
            .unwrap_or_else(|| TreeNode::dir("/"));
        Ok(RamVolume::mount_volume(tree))
    }
}
