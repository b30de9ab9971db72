//! File-backed disks
//!
//! Turns host `.img` files into block devices. Each image is opened
//! read/write; its length (in whole sectors) fixes the device size.

use crate::device::{BlockDevice, DeviceError, SECTOR_SIZE};
use crate::DeviceRegistry;

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A block device backed by a disk image file
pub struct DiskDevice {
    name: String,
    total_sectors: u64,
    stream: Mutex<fs::File>,
}

impl DiskDevice {
    /// Open a disk image. Trailing bytes that do not fill a whole sector
    /// are ignored.
    pub fn open(path: &Path) -> io::Result<Self> {
        let stream = OpenOptions::new().read(true).write(true).open(path)?;
        let total_sectors = stream.metadata()?.len() / SECTOR_SIZE as u64;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            total_sectors,
            stream: Mutex::new(stream),
        })
    }

    fn check_range(&self, lba: u64, len: usize) -> Result<(), DeviceError> {
        if len % SECTOR_SIZE != 0 {
            return Err(DeviceError::BadLength);
        }
        if lba + (len / SECTOR_SIZE) as u64 > self.total_sectors {
            return Err(DeviceError::OutOfRange);
        }
        Ok(())
    }
}

impl BlockDevice for DiskDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_count(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&self, lba: u64, buffer: &mut [u8]) -> Result<(), DeviceError> {
        self.check_range(lba, buffer.len())?;

        let mut stream = self.stream.lock().map_err(|_| DeviceError::Io)?;
        stream
            .seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))
            .and_then(|_| stream.read_exact(buffer))
            .map_err(|err| {
                log::error!("{}: read at lba {} failed: {}", self.name, lba, err);
                DeviceError::Io
            })
    }

    fn write_sectors(&self, lba: u64, buffer: &[u8]) -> Result<(), DeviceError> {
        self.check_range(lba, buffer.len())?;

        let mut stream = self.stream.lock().map_err(|_| DeviceError::Io)?;
        stream
            .seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))
            .and_then(|_| stream.write_all(buffer))
            .map_err(|err| {
                log::error!("{}: write at lba {} failed: {}", self.name, lba, err);
                DeviceError::Io
            })
    }
}

/// Scan `dir` for `*.img` files and register each one as a disk device.
///
/// Files are visited in name order so device ids are stable across hosts.
/// Returns the number of devices attached.
pub fn scan_image_dir(dir: &Path, registry: &mut DeviceRegistry) -> io::Result<usize> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "img"))
        .collect();
    images.sort();

    for path in &images {
        let disk = DiskDevice::open(path)?;
        let id = registry.add_device(Arc::new(disk));
        log::info!("attached {} as device {}", path.display(), id);
    }

    Ok(images.len())
}
