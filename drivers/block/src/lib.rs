//! Block Device Layer
//!
//! Owns the process's disk-backed devices and hands out sector I/O by id.

pub mod device;
pub mod disk;

pub use device::{BlockDevice, DeviceError, SECTOR_SIZE};
pub use disk::{scan_image_dir, DiskDevice};

use std::sync::Arc;

/// Device table: dense, append-only, indexed by id
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<dyn BlockDevice>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its id (the insertion index)
    pub fn add_device(&mut self, device: Arc<dyn BlockDevice>) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    /// Get a device by id
    pub fn get(&self, id: usize) -> Option<Arc<dyn BlockDevice>> {
        self.devices.get(id).cloned()
    }

    /// Get the number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check whether any device has been registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
