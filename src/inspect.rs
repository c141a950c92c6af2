// src/inspect.rs

//! Guest OS inspection
//!
//! After the disks are attached and the appliance is launched, the
//! inspector unlocks encrypted volumes, identifies the installed
//! operating system and mounts its filesystems. The pipeline treats
//! most of the result opaquely (the conversion module consumes it);
//! the core itself only looks at the firmware, the distro tag and
//! the product name.
//!
//! The inspector also enforces the guest free-space check: driver
//! injection writes into the guest, so every mounted filesystem must
//! have headroom before conversion starts.

use crate::appliance::Appliance;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

/// Firmware the inspector determined the guest boots with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestFirmware {
    Bios,
    Uefi {
        /// EFI system partitions found on the disks
        esp_devices: Vec<String>,
    },
}

/// statvfs fields of one mounted filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

/// A filesystem currently mounted inside the appliance
#[derive(Debug, Clone)]
pub struct MountedFs {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
}

/// Per-mountpoint statistics gathered after inspection
#[derive(Debug, Clone)]
pub struct MountStats {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub stats: FsStats,
}

/// What the inspector learned about the guest
#[derive(Debug, Clone)]
pub struct Inspect {
    /// Root device of the guest OS
    pub root: String,
    /// OS family ("linux", "windows", ...)
    pub os_type: String,
    pub distro: String,
    pub product_name: String,
    pub arch: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub package_format: String,
    pub package_management: String,
    pub firmware: GuestFirmware,
    /// (mountpoint, device) pairs, shallowest first
    pub mountpoints: Vec<(String, String)>,
}

impl Inspect {
    pub fn is_windows(&self) -> bool {
        self.os_type == "windows"
    }
}

/// Unlock encrypted volumes and inspect the guest.
///
/// `keys` maps device names to passphrases; every entry is applied
/// before inspection so that encrypted filesystems are visible.
pub fn inspect_guest(
    appliance: &mut dyn Appliance,
    keys: &BTreeMap<String, String>,
) -> Result<Inspect> {
    for (device, passphrase) in keys {
        debug!("unlocking encrypted device {}", device);
        appliance.unlock_device(device, passphrase)?;
    }
    let inspect = appliance.inspect()?;
    info!(
        "inspected guest: {} {} ({})",
        inspect.distro, inspect.product_name, inspect.os_type
    );
    Ok(inspect)
}

/// Collect statvfs for every mounted filesystem
pub fn collect_mount_stats(appliance: &mut dyn Appliance) -> Result<Vec<MountStats>> {
    let mut out = Vec::new();
    for fs in appliance.mounted_filesystems()? {
        let stats = appliance.statvfs(&fs.mountpoint)?;
        debug!(
            "{} on {} ({}): {} of {} blocks free",
            fs.device, fs.mountpoint, fs.fs_type, stats.bfree, stats.blocks
        );
        out.push(MountStats {
            device: fs.device,
            mountpoint: fs.mountpoint,
            fs_type: fs.fs_type,
            stats,
        });
    }
    Ok(out)
}

/// Minimum free bytes required on a mountpoint before conversion
fn required_headroom(mountpoint: &str, has_boot: bool, windows: bool) -> u64 {
    match mountpoint {
        "/boot" => 50 * MIB,
        "/" => {
            if !has_boot && !windows {
                50 * MIB
            } else {
                100 * MIB
            }
        }
        _ => 10 * MIB,
    }
}

/// Check that every mounted filesystem has enough free space and
/// free inodes for the conversion to write into the guest.
pub fn check_guest_free_space(mounts: &[MountStats], windows: bool) -> Result<()> {
    let has_boot = mounts.iter().any(|m| m.mountpoint == "/boot");

    for mount in mounts {
        let needed = required_headroom(&mount.mountpoint, has_boot, windows);
        let free = mount.stats.bfree * mount.stats.bsize;
        if free < needed {
            return Err(Error::Inspection(format!(
                "not enough free space for conversion on filesystem '{}': \
                 {} bytes free, {} bytes needed",
                mount.mountpoint, free, needed
            )));
        }
        // A filesystem reporting files == 0 does not track inode
        // counts (e.g. btrfs); skip the inode check there.
        if mount.stats.files > 0 && mount.stats.ffree < 100 {
            return Err(Error::Inspection(format!(
                "not enough free inodes on filesystem '{}': {} free",
                mount.mountpoint, mount.stats.ffree
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(mountpoint: &str, fs_type: &str, bsize: u64, blocks: u64, bfree: u64) -> MountStats {
        MountStats {
            device: format!("/dev/sda{}", mountpoint.len()),
            mountpoint: mountpoint.to_string(),
            fs_type: fs_type.to_string(),
            stats: FsStats {
                bsize,
                blocks,
                bfree,
                bavail: bfree,
                files: 65536,
                ffree: 60000,
            },
        }
    }

    #[test]
    fn test_root_alone_needs_50_mib() {
        // 49 MiB free on a lone root: rejected
        let m = mount("/", "ext4", 4096, 1 << 20, 49 * 256);
        assert!(check_guest_free_space(&[m], false).is_err());
        // 51 MiB free: accepted
        let m = mount("/", "ext4", 4096, 1 << 20, 51 * 256);
        assert!(check_guest_free_space(&[m], false).is_ok());
    }

    #[test]
    fn test_root_with_separate_boot_needs_100_mib() {
        let root = mount("/", "ext4", 4096, 1 << 20, 60 * 256);
        let boot = mount("/boot", "ext4", 4096, 65536, 51 * 256);
        // 60 MiB on / is plenty alone but not with a separate /boot
        assert!(check_guest_free_space(&[root.clone(), boot.clone()], false).is_err());
        let root = mount("/", "ext4", 4096, 1 << 20, 101 * 256);
        assert!(check_guest_free_space(&[root, boot], false).is_ok());
    }

    #[test]
    fn test_windows_root_needs_100_mib() {
        let m = mount("/", "ntfs", 4096, 1 << 20, 60 * 256);
        assert!(check_guest_free_space(&[m], true).is_err());
        let m = mount("/", "ntfs", 4096, 1 << 20, 101 * 256);
        assert!(check_guest_free_space(&[m], true).is_ok());
    }

    #[test]
    fn test_boot_needs_50_mib() {
        let root = mount("/", "ext4", 4096, 1 << 20, 1 << 18);
        let boot = mount("/boot", "ext4", 4096, 65536, 49 * 256);
        assert!(check_guest_free_space(&[root, boot], false).is_err());
    }

    #[test]
    fn test_other_mountpoints_need_10_mib() {
        let root = mount("/", "ext4", 4096, 1 << 20, 1 << 18);
        let home = mount("/home", "xfs", 4096, 1 << 20, 9 * 256);
        assert!(check_guest_free_space(&[root.clone(), home], false).is_err());
        let home = mount("/home", "xfs", 4096, 1 << 20, 11 * 256);
        assert!(check_guest_free_space(&[root, home], false).is_ok());
    }

    #[test]
    fn test_inode_check() {
        let mut m = mount("/", "ext4", 4096, 1 << 20, 1 << 18);
        m.stats.ffree = 99;
        assert!(check_guest_free_space(&[m], false).is_err());
    }

    #[test]
    fn test_inode_check_skipped_when_files_zero() {
        let mut m = mount("/", "btrfs", 4096, 1 << 20, 1 << 18);
        m.stats.files = 0;
        m.stats.ffree = 0;
        assert!(check_guest_free_space(&[m], false).is_ok());
    }

    #[test]
    fn test_is_windows() {
        let inspect = Inspect {
            root: "/dev/sda2".into(),
            os_type: "windows".into(),
            distro: "windows".into(),
            product_name: "Windows Server 2019".into(),
            arch: "x86_64".into(),
            major_version: 10,
            minor_version: 0,
            package_format: "unknown".into(),
            package_management: "unknown".into(),
            firmware: GuestFirmware::Bios,
            mountpoints: vec![("/".into(), "/dev/sda2".into())],
        };
        assert!(inspect.is_windows());
    }
}
