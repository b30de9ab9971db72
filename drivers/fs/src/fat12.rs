//! FAT12 Filesystem Support
//!
//! Read-only driver for FAT12 volumes. The boot sector and the whole file
//! allocation table are read once at mount; directory scans and file reads
//! go through a one-cluster scratch buffer.

use crate::vfs::{Filesystem, Volume};
use crate::vnode::{Vnode, VnodeFlags, VnodeKind, VnodeOps};
use crate::FsError;

use bitflags::bitflags;
use spin::Mutex;
use std::sync::{Arc, Weak};
use vfsim_block::{BlockDevice, SECTOR_SIZE};

/// Vnode cache slots per mounted volume
const MAX_VNODES_PER_VOLUME: usize = 16;

/// Directory entry size on disk
const DIR_ENTRY_SIZE: usize = 32;

/// End-of-chain marker: any FAT value at or above this ends the chain
pub const FAT12_EOC: u16 = 0x0FF8;

bitflags! {
    /// FAT directory entry attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        /// Long-filename marker (the low four bits combined)
        const LFN = 0x0F;
    }
}

/// FAT12 boot sector / BIOS parameter block, parsed from sector 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub table_count: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media_type: u8,
    pub table_size_16: u16,
    pub sectors_per_track: u16,
    pub head_side_count: u16,
    pub hidden_sector_count: u32,
    pub total_sectors_32: u32,
}

impl BootSector {
    /// Parse the BPB fields out of sector 0
    pub fn parse(sector: &[u8]) -> Result<Self, FsError> {
        if sector.len() < SECTOR_SIZE {
            return Err(FsError::Io);
        }
        let u16_at = |offset: usize| u16::from_le_bytes([sector[offset], sector[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                sector[offset],
                sector[offset + 1],
                sector[offset + 2],
                sector[offset + 3],
            ])
        };

        let boot = Self {
            bytes_per_sector: u16_at(0x0B),
            sectors_per_cluster: sector[0x0D],
            reserved_sector_count: u16_at(0x0E),
            table_count: sector[0x10],
            root_entry_count: u16_at(0x11),
            total_sectors_16: u16_at(0x13),
            media_type: sector[0x15],
            table_size_16: u16_at(0x16),
            sectors_per_track: u16_at(0x18),
            head_side_count: u16_at(0x1A),
            hidden_sector_count: u32_at(0x1C),
            total_sectors_32: u32_at(0x20),
        };

        // The registry hands out 512-byte sectors; anything else cannot be
        // addressed through it.
        if boot.bytes_per_sector as usize != SECTOR_SIZE
            || boot.sectors_per_cluster == 0
            || boot.table_count == 0
            || boot.table_size_16 == 0
        {
            return Err(FsError::Generic);
        }

        Ok(boot)
    }

    /// Bytes in one cluster
    pub fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * self.bytes_per_sector as usize
    }

    /// Sectors occupied by the fixed root directory region
    pub fn root_dir_sectors(&self) -> u32 {
        (self.root_entry_count as u32 * DIR_ENTRY_SIZE as u32) / self.bytes_per_sector as u32
    }

    /// First sector of the root directory region
    pub fn root_dir_start(&self) -> u32 {
        self.reserved_sector_count as u32 + self.table_size_16 as u32 * self.table_count as u32
    }

    /// First sector of the data region
    pub fn data_start(&self) -> u32 {
        self.root_dir_start() + self.root_dir_sectors()
    }

    /// Map a cluster number to its first sector
    pub fn cluster_to_lba(&self, cluster: u16) -> u64 {
        (self.data_start() + (cluster as u32 - 2) * self.sectors_per_cluster as u32) as u64
    }
}

/// On-disk 32-byte directory entry
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    /// 8.3 name: space-padded base and extension, no dot
    pub name: [u8; 11],
    pub attributes: FatAttributes,
    pub nt_reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub first_cluster_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
}

impl RawDirEntry {
    /// Parse one directory entry. `bytes` must hold at least 32 bytes.
    pub fn parse(bytes: &[u8]) -> Self {
        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

        let mut name = [0u8; 11];
        name.copy_from_slice(&bytes[..11]);

        Self {
            name,
            attributes: FatAttributes::from_bits_retain(bytes[11]),
            nt_reserved: bytes[12],
            creation_time_tenths: bytes[13],
            creation_time: u16_at(14),
            creation_date: u16_at(16),
            last_access_date: u16_at(18),
            first_cluster_high: u16_at(20),
            write_time: u16_at(22),
            write_date: u16_at(24),
            first_cluster_low: u16_at(26),
            file_size: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
        }
    }

    fn is_dir(&self) -> bool {
        self.attributes.contains(FatAttributes::DIRECTORY)
    }
}

/// Normalize a path component to the on-disk 11-byte 8.3 form:
/// space-padded, uppercase, split at the first dot.
pub fn to_fat_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];

    let (base, extension) = match name.split_once('.') {
        Some((base, extension)) => (base, Some(extension)),
        None => (name, None),
    };

    for (i, byte) in base.bytes().take(8).enumerate() {
        out[i] = byte.to_ascii_uppercase();
    }
    if let Some(extension) = extension {
        for (i, byte) in extension.bytes().take(3).enumerate() {
            out[8 + i] = byte.to_ascii_uppercase();
        }
    }

    out
}

fn scan_entries(buffer: &[u8], count: usize, fat_name: &[u8; 11]) -> Option<RawDirEntry> {
    buffer
        .chunks_exact(DIR_ENTRY_SIZE)
        .take(count)
        .find(|entry| &entry[..11] == fat_name)
        .map(RawDirEntry::parse)
}

struct CacheSlot {
    name: [u8; 11],
    node: Arc<Vnode>,
}

/// Fixed-size vnode cache. Identity is keyed by the 11-byte on-disk name;
/// a slot can be reclaimed once its vnode is unreferenced.
struct NodeCache {
    slots: [Option<CacheSlot>; MAX_VNODES_PER_VOLUME],
}

impl NodeCache {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    fn find(&self, name: &[u8; 11]) -> Option<Arc<Vnode>> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| &slot.name == name)
            .map(|slot| slot.node.clone())
    }

    /// Store in the first free slot, or evict the first slot whose vnode is
    /// unreferenced. Fails when every slot is pinned.
    fn insert(&mut self, name: [u8; 11], node: Arc<Vnode>) -> Result<(), FsError> {
        for slot in self.slots.iter_mut() {
            let usable = match slot {
                None => true,
                Some(occupied) => occupied.node.ref_count() == 0,
            };
            if usable {
                *slot = Some(CacheSlot { name, node });
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

/// A mounted FAT12 volume
pub struct Fat12Volume {
    device: Arc<dyn BlockDevice>,
    boot: BootSector,
    /// Entire FAT region, read once at mount
    fat: Vec<u8>,
    /// One-cluster scratch buffer shared by directory scans and file reads
    scratch: Mutex<Vec<u8>>,
    cache: Mutex<NodeCache>,
    root: Arc<Vnode>,
}

impl Fat12Volume {
    /// Parse the on-disk structures and build the volume with its root
    /// vnode. The root directory has no backing entry.
    pub fn mount_volume(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, FsError> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        device.read_sectors(0, &mut sector)?;
        let boot = BootSector::parse(&sector)?;

        let mut fat = vec![0u8; boot.table_size_16 as usize * boot.bytes_per_sector as usize];
        device.read_sectors(boot.reserved_sector_count as u64, &mut fat)?;

        let scratch = vec![0u8; boot.cluster_bytes()];

        log::debug!(
            "{}: fat12 volume, {} sectors/cluster, fat {} sectors, root {} sectors",
            device.name(),
            boot.sectors_per_cluster,
            boot.table_size_16,
            boot.root_dir_sectors(),
        );

        Ok(Arc::new_cyclic(|volume: &Weak<Fat12Volume>| {
            let owner: Weak<dyn Volume> = volume.clone();
            let root = Arc::new(Vnode::new(
                VnodeKind::Directory,
                VnodeFlags::ROOT,
                owner,
                Box::new(Fat12Node {
                    volume: volume.clone(),
                    entry: None,
                }),
            ));
            Self {
                device,
                boot,
                fat,
                scratch: Mutex::new(scratch),
                cache: Mutex::new(NodeCache::new()),
                root,
            }
        }))
    }

    /// Next cluster in the packed 12-bit chain
    pub fn next_cluster(&self, cluster: u16) -> u16 {
        let index = cluster as usize * 3 / 2;
        if index + 1 >= self.fat.len() {
            return FAT12_EOC;
        }

        let word = u16::from_le_bytes([self.fat[index], self.fat[index + 1]]);
        if cluster % 2 == 0 {
            word & 0x0FFF
        } else {
            word >> 4
        }
    }

    fn read_cluster(&self, cluster: u16, buffer: &mut [u8]) -> Result<(), FsError> {
        let bytes = self.boot.cluster_bytes();
        self.device
            .read_sectors(self.boot.cluster_to_lba(cluster), &mut buffer[..bytes])?;
        Ok(())
    }

    fn lookup_in_root(self: &Arc<Self>, fat_name: &[u8; 11]) -> Result<Arc<Vnode>, FsError> {
        let entries_per_sector = self.boot.bytes_per_sector as usize / DIR_ENTRY_SIZE;

        let found = {
            let mut scratch = self.scratch.lock();
            let mut found = None;
            for i in 0..self.boot.root_dir_sectors() {
                let lba = (self.boot.root_dir_start() + i) as u64;
                self.device
                    .read_sectors(lba, &mut scratch[..SECTOR_SIZE])?;
                found = scan_entries(&scratch[..SECTOR_SIZE], entries_per_sector, fat_name);
                if found.is_some() {
                    break;
                }
            }
            found
        };

        match found {
            Some(entry) => self.node_for_entry(entry),
            None => Err(FsError::NotFound),
        }
    }

    fn lookup_in_dir(
        self: &Arc<Self>,
        dir: &RawDirEntry,
        fat_name: &[u8; 11],
    ) -> Result<Arc<Vnode>, FsError> {
        let entries_per_cluster = self.boot.cluster_bytes() / DIR_ENTRY_SIZE;

        let found = {
            let mut scratch = self.scratch.lock();
            let mut cluster = dir.first_cluster_low;
            let mut found = None;
            while (2..FAT12_EOC).contains(&cluster) {
                self.read_cluster(cluster, &mut scratch)?;
                found = scan_entries(&scratch, entries_per_cluster, fat_name);
                if found.is_some() {
                    break;
                }
                cluster = self.next_cluster(cluster);
            }
            found
        };

        match found {
            Some(entry) => self.node_for_entry(entry),
            None => Err(FsError::NotFound),
        }
    }

    /// Return the cached vnode for this entry, or build one and cache it
    fn node_for_entry(self: &Arc<Self>, entry: RawDirEntry) -> Result<Arc<Vnode>, FsError> {
        let mut cache = self.cache.lock();
        if let Some(node) = cache.find(&entry.name) {
            return Ok(node);
        }

        let kind = if entry.is_dir() {
            VnodeKind::Directory
        } else {
            VnodeKind::Regular
        };
        let name = entry.name;
        let owner: Weak<dyn Volume> = Arc::downgrade(&(self.clone() as Arc<dyn Volume>));
        let node = Arc::new(Vnode::new(
            kind,
            VnodeFlags::empty(),
            owner,
            Box::new(Fat12Node {
                volume: Arc::downgrade(self),
                entry: Some(entry),
            }),
        ));

        cache.insert(name, node.clone())?;
        Ok(node)
    }

    fn read_file(
        &self,
        entry: &RawDirEntry,
        buffer: &mut [u8],
        offset: u64,
    ) -> Result<usize, FsError> {
        let file_size = entry.file_size as u64;
        if offset >= file_size {
            return Ok(0);
        }

        let cluster_bytes = self.boot.cluster_bytes() as u64;
        // Never hand out bytes past the recorded file size; the tail of the
        // last cluster is allocation slack, not content.
        let wanted = buffer.len().min((file_size - offset) as usize);

        let mut cluster = entry.first_cluster_low;
        for _ in 0..offset / cluster_bytes {
            cluster = self.next_cluster(cluster);
        }

        let mut within = (offset % cluster_bytes) as usize;
        let mut produced = 0;
        let mut scratch = self.scratch.lock();

        while (2..FAT12_EOC).contains(&cluster) && produced < wanted {
            self.read_cluster(cluster, &mut scratch)?;

            let take = (cluster_bytes as usize - within).min(wanted - produced);
            buffer[produced..produced + take].copy_from_slice(&scratch[within..within + take]);

            produced += take;
            within = 0;
            cluster = self.next_cluster(cluster);
        }

        Ok(produced)
    }
}

impl Volume for Fat12Volume {
    fn root(&self) -> Arc<Vnode> {
        self.root.clone()
    }

    fn unmount(&self) {
        self.cache.lock().clear();
    }
}

/// Driver payload behind each FAT12 vnode. The root directory carries no
/// backing entry.
struct Fat12Node {
    volume: Weak<Fat12Volume>,
    entry: Option<RawDirEntry>,
}

impl Fat12Node {
    fn volume(&self) -> Result<Arc<Fat12Volume>, FsError> {
        self.volume.upgrade().ok_or(FsError::Generic)
    }
}

impl VnodeOps for Fat12Node {
    fn read(&self, buffer: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let entry = match &self.entry {
            Some(entry) if !entry.is_dir() => entry,
            _ => return Err(FsError::IsADirectory),
        };
        self.volume()?.read_file(entry, buffer, offset)
    }

    fn write(&self, _buffer: &[u8], _offset: u64) -> Result<usize, FsError> {
        // Write support is not implemented; the contract is "0 bytes
        // consumed".
        Ok(0)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Vnode>, FsError> {
        let volume = self.volume()?;
        let fat_name = to_fat_name(name);

        match &self.entry {
            None => volume.lookup_in_root(&fat_name),
            Some(entry) if entry.is_dir() => volume.lookup_in_dir(entry, &fat_name),
            Some(_) => Err(FsError::NotADirectory),
        }
    }
}

/// The registered FAT12 driver
pub struct Fat12Fs;

impl Filesystem for Fat12Fs {
    fn fs_name(&self) -> &str {
        "fat12"
    }

    fn mount(
        &self,
        _device_id: usize,
        device: Option<Arc<dyn BlockDevice>>,
    ) -> Result<Arc<dyn Volume>, FsError> {
        let device = device.ok_or(FsError::Generic)?;
        Ok(Fat12Volume::mount_volume(device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fat12_image, set_fat12, FatFile, MemDevice};

    fn mounted(files: &[FatFile]) -> Arc<Fat12Volume> {
        let device = Arc::new(MemDevice::new(fat12_image(files)));
        Fat12Volume::mount_volume(device).unwrap()
    }

    #[test]
    fn fat_name_normalization() {
        assert_eq!(&to_fat_name("hi.txt"), b"HI      TXT");
        assert_eq!(&to_fat_name("readme"), b"README     ");
        assert_eq!(&to_fat_name("verylongname.text"), b"VERYLONGTEX");
        assert_eq!(&to_fat_name("MSG.TXT"), b"MSG     TXT");
    }

    #[test]
    fn fat_name_normalization_is_a_fixed_point_without_dots() {
        let once = to_fat_name("readme");
        let again = to_fat_name(std::str::from_utf8(&once).unwrap());
        assert_eq!(once, again);
    }

    #[test]
    fn packed_fat_extraction_even_and_odd() {
        // Entries: 2 -> 3, 3 -> 4, 4 -> end of chain.
        let mut fat = vec![0u8; 12];
        set_fat12(&mut fat, 2, 0x003);
        set_fat12(&mut fat, 3, 0x004);
        set_fat12(&mut fat, 4, 0xFFF);

        // Even clusters take the low 12 bits of the word at 3c/2, odd
        // clusters the high 12.
        let word_at = |index: usize| u16::from_le_bytes([fat[index], fat[index + 1]]);
        assert_eq!(word_at(3) & 0x0FFF, 0x003);
        assert_eq!(word_at(4) >> 4, 0x004);
        assert_eq!(word_at(6) & 0x0FFF, 0xFFF);

        let volume = mounted(&[FatFile::file("chain.bin", &[0xAB; 1536])]);
        assert_eq!(volume.next_cluster(2), 3);
        assert_eq!(volume.next_cluster(3), 4);
        assert!(volume.next_cluster(4) >= FAT12_EOC);
    }

    #[test]
    fn boot_sector_parses_the_bpb() {
        let image = fat12_image(&[]);
        let boot = BootSector::parse(&image[..SECTOR_SIZE]).unwrap();

        assert_eq!(boot.bytes_per_sector, 512);
        assert_eq!(boot.sectors_per_cluster, 1);
        assert_eq!(boot.reserved_sector_count, 1);
        assert_eq!(boot.table_count, 2);
        assert_eq!(boot.root_entry_count, 32);
        assert_eq!(boot.table_size_16, 2);
    }

    #[test]
    fn boot_sector_rejects_foreign_geometry() {
        let mut sector = fat12_image(&[])[..SECTOR_SIZE].to_vec();
        sector[0x0B] = 0x00;
        sector[0x0C] = 0x04; // 1024 bytes per sector
        assert_eq!(BootSector::parse(&sector), Err(FsError::Generic));
    }

    #[test]
    fn cluster_to_lba_uses_the_region_layout() {
        let image = fat12_image(&[]);
        let boot = BootSector::parse(&image[..SECTOR_SIZE]).unwrap();

        // reserved (1) + fats (2 * 2) + root (32 * 32 / 512 = 2) = 7
        assert_eq!(boot.data_start(), 7);
        assert_eq!(boot.cluster_to_lba(2), 7);
        assert_eq!(boot.cluster_to_lba(5), 10);
    }

    #[test]
    fn reads_follow_the_cluster_chain_in_order() {
        let mut contents = Vec::new();
        for i in 0..1536u32 {
            contents.push((i % 251) as u8);
        }
        let volume = mounted(&[FatFile::file("chain.bin", &contents)]);

        let node = volume.root().ops().lookup("chain.bin").unwrap();
        let mut buffer = vec![0u8; 1536];
        assert_eq!(node.ops().read(&mut buffer, 0).unwrap(), 1536);
        assert_eq!(buffer, contents);
    }

    #[test]
    fn reads_start_mid_chain_when_the_offset_skips_clusters() {
        let mut contents = vec![0u8; 1536];
        for (i, byte) in contents.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let volume = mounted(&[FatFile::file("chain.bin", &contents)]);

        let node = volume.root().ops().lookup("chain.bin").unwrap();
        let mut buffer = vec![0u8; 700];
        assert_eq!(node.ops().read(&mut buffer, 600).unwrap(), 700);
        assert_eq!(buffer, &contents[600..1300]);
    }

    #[test]
    fn reads_clamp_at_the_recorded_file_size() {
        // 700 bytes occupy two 512-byte clusters; the second is mostly
        // slack that must never be handed out.
        let contents = vec![0x5A; 700];
        let volume = mounted(&[FatFile::file("data.bin", &contents)]);

        let node = volume.root().ops().lookup("data.bin").unwrap();
        let mut buffer = vec![0u8; 512];
        assert_eq!(node.ops().read(&mut buffer, 600).unwrap(), 100);
        assert!(buffer[..100].iter().all(|&b| b == 0x5A));

        assert_eq!(node.ops().read(&mut buffer, 700).unwrap(), 0);
        assert_eq!(node.ops().read(&mut buffer, 9999).unwrap(), 0);
    }

    #[test]
    fn lookup_type_checks() {
        let volume = mounted(&[
            FatFile::file("file.txt", b"x"),
            FatFile::dir("sub", &[FatFile::file("inner.txt", b"y")]),
        ]);
        let root = volume.root();

        let file = root.ops().lookup("file.txt").unwrap();
        assert_eq!(file.kind(), VnodeKind::Regular);
        assert_eq!(
            file.ops().lookup("anything").unwrap_err(),
            FsError::NotADirectory
        );

        let sub = root.ops().lookup("sub").unwrap();
        assert_eq!(sub.kind(), VnodeKind::Directory);
        let mut buffer = [0u8; 1];
        assert_eq!(
            sub.ops().read(&mut buffer, 0).unwrap_err(),
            FsError::IsADirectory
        );

        let inner = sub.ops().lookup("inner.txt").unwrap();
        assert_eq!(inner.ops().read(&mut buffer, 0).unwrap(), 1);
        assert_eq!(&buffer, b"y");

        assert_eq!(
            root.ops().lookup("missing.txt").unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn the_root_vnode_is_a_flagged_directory() {
        let volume = mounted(&[]);
        let root = volume.root();
        assert_eq!(root.kind(), VnodeKind::Directory);
        assert!(root.flags().contains(VnodeFlags::ROOT));
        assert_eq!(root.ref_count(), 0);
    }

    #[test]
    fn lookups_of_the_same_entry_share_a_vnode() {
        let volume = mounted(&[FatFile::file("same.txt", b"id")]);
        let root = volume.root();

        let first = root.ops().lookup("same.txt").unwrap();
        let second = root.ops().lookup("same.txt").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn cache_evicts_unreferenced_slots_and_fails_when_pinned() {
        let mut files = Vec::new();
        for i in 0..17 {
            files.push(FatFile::file_owned(format!("f{i:02}.bin"), vec![i as u8]));
        }
        let volume = mounted(&files);
        let root = volume.root();

        // Fill all 16 slots, keeping the vnodes pinned.
        let pinned: Vec<_> = (0..16)
            .map(|i| {
                let node = root.ops().lookup(&format!("f{i:02}.bin")).unwrap();
                node.grab();
                node
            })
            .collect();

        assert_eq!(
            root.ops().lookup("f16.bin").unwrap_err(),
            FsError::OutOfMemory
        );

        // Releasing one slot makes room again, and the evicted entry loses
        // its cached identity.
        pinned[0].release();
        let newcomer = root.ops().lookup("f16.bin").unwrap();
        assert_eq!(newcomer.kind(), VnodeKind::Regular);

        let replacement = root.ops().lookup("f00.bin").unwrap();
        assert!(!Arc::ptr_eq(&pinned[0], &replacement));
    }

    #[test]
    fn fat12_write_is_a_stub() {
        let volume = mounted(&[FatFile::file("file.txt", b"abc")]);
        let node = volume.root().ops().lookup("file.txt").unwrap();
        assert_eq!(node.ops().write(b"xyz", 0).unwrap(), 0);
    }

    #[test]
    fn driver_requires_a_block_device() {
        assert!(matches!(Fat12Fs.mount(0, None), Err(FsError::Generic)));
    }
}
