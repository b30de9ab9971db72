//! Vfsim demo entry point
//!
//! Scans `disks/` for images, mounts the first one as a FAT12 volume at
//! `/` and streams a file from it in small chunks.

use std::path::Path;
use std::process;
use std::sync::Arc;

use vfsim_block::{scan_image_dir, BlockDevice};
use vfsim_fs::fat12::Fat12Fs;
use vfsim_fs::vfs::Vfs;
use vfsim_fs::OpenMode;

fn main() {
    env_logger::init();

    let mut vfs = Vfs::new();
    if vfs.register_filesystem(Arc::new(Fat12Fs)).is_err() {
        eprintln!("error while registering the fat12 driver");
        process::exit(1);
    }

    if let Err(err) = scan_image_dir(Path::new("disks"), vfs.devices_mut()) {
        eprintln!("error while opening the disks directory: {err}");
        process::exit(1);
    }
    println!("device number {}", vfs.devices().len());

    let device_name = match vfs.devices().get(0) {
        Some(device) => device.name().to_string(),
        None => {
            eprintln!("no disk images found under disks/");
            process::exit(1);
        }
    };

    println!("mounting {device_name} to /");
    if let Err(err) = vfs.mount("fat12", "/", 0) {
        eprintln!("error while mounting {device_name} at /: {err}");
        process::exit(1);
    }

    let path = std::env::args().nth(1).unwrap_or_else(|| "/hi.txt".to_string());

    println!("opening {path}");
    let fd = match vfs.open(&path, OpenMode::RDONLY) {
        Ok(fd) => fd,
        Err(err) => {
            eprintln!("error while opening {path}: {err} (code {})", err.code());
            process::exit(1);
        }
    };
    println!("descriptor: {fd}");

    println!("content:");
    let mut chunk = [0u8; 9];
    loop {
        match vfs.read(fd, &mut chunk) {
            Ok(0) => break,
            Ok(produced) => print!("{}", String::from_utf8_lossy(&chunk[..produced])),
            Err(err) => {
                eprintln!("error while reading {path}: {err}");
                break;
            }
        }
    }
    println!();

    if let Err(err) = vfs.close(fd) {
        eprintln!("error while closing {path}: {err}");
    }
}
