// src/estimate.rs

//! Target disk space estimation
//!
//! Before the copy starts, the output may pre-allocate space on the
//! target, so the pipeline computes a per-overlay upper bound on the
//! number of bytes the copied image will need. Two effects shrink
//! the copy below the virtual size: fstrim zeroes the free space of
//! filesystems that support it, and the copier skips zeroed ranges.
//!
//! The estimate projects filesystem-level free space onto raw-disk
//! space (filesystems are smaller than the disks that hold them) and
//! apportions the saving among the overlays by virtual size. It is
//! conservative in both directions: never larger than the virtual
//! size, never smaller than the virtual size minus all free space.

use crate::error::Result;
use crate::inspect::MountStats;
use crate::overlay::Overlay;
use crate::qemuimg;
use serde::Serialize;
use tracing::debug;

/// Whether fstrim is expected to succeed on this filesystem type.
///
/// NTFS nominally supports trim but the appliance's driver does not
/// punch holes reliably, so it contributes no saving.
fn fstrim_expected(fs_type: &str) -> bool {
    matches!(fs_type, "ext2" | "ext3" | "ext4" | "xfs")
}

/// Compute `estimated_size` for every overlay.
///
/// A source without disks (`src_total == 0`) leaves the estimates
/// unset; callers treat a missing estimate as "unknown".
pub fn estimate_target_sizes(mounts: &[MountStats], overlays: &[Overlay]) {
    let fs_total: u64 = mounts.iter().map(|m| m.stats.blocks * m.stats.bsize).sum();
    let src_total: u64 = overlays.iter().map(|ov| ov.virtual_size).sum();
    if src_total == 0 {
        return;
    }

    let ratio = fs_total as f64 / src_total as f64;
    let fs_free: u64 = mounts
        .iter()
        .filter(|m| fstrim_expected(&m.fs_type))
        .map(|m| m.stats.bfree * m.stats.bsize)
        .sum();
    let scaled_saving = (fs_free as f64 * ratio).floor() as u64;
    debug!(
        "estimator: fs_total={} src_total={} fs_free={} scaled_saving={}",
        fs_total, src_total, fs_free, scaled_saving
    );

    for ov in overlays {
        let proportion = ov.virtual_size as f64 / src_total as f64;
        let saving = (proportion * scaled_saving as f64).floor() as u64;
        let estimate = ov.virtual_size.saturating_sub(saving);
        debug!(
            "estimator: disk {} estimated at {} of {} bytes",
            ov.source.id, estimate, ov.virtual_size
        );
        ov.stats.borrow_mut().estimated_size = Some(estimate);
    }
}

#[derive(Serialize)]
struct EstimateDoc {
    disks: Vec<u64>,
    total: u64,
}

/// Render the `--print-estimate` report.
///
/// Sizes come from running the measurement tool on each overlay;
/// machine-readable mode produces the JSON document, otherwise one
/// human-readable line per disk plus a total.
pub fn render_estimate(sizes: &[u64], machine_readable: bool) -> Result<String> {
    let total: u64 = sizes.iter().sum();
    if machine_readable {
        let doc = EstimateDoc {
            disks: sizes.to_vec(),
            total,
        };
        let mut rendered = serde_json::to_string_pretty(&doc)?;
        rendered.push('\n');
        Ok(rendered)
    } else {
        let mut out = String::new();
        for (i, size) in sizes.iter().enumerate() {
            out.push_str(&format!("disk {}: {}\n", i + 1, size));
        }
        out.push_str(&format!("total: {}\n", total));
        Ok(out)
    }
}

/// Measure every overlay and render the estimate report
pub fn print_estimate(overlays: &[Overlay], machine_readable: bool) -> Result<String> {
    let mut sizes = Vec::with_capacity(overlays.len());
    for ov in overlays {
        let measurement = qemuimg::measure(&ov.path)?;
        sizes.push(measurement.required);
    }
    render_estimate(&sizes, machine_readable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::FsStats;
    use crate::overlay::OverlayStats;
    use crate::source::{ControllerKind, SourceDisk};
    use std::cell::RefCell;
    use std::path::PathBuf;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn overlay(id: usize, virtual_size: u64) -> Overlay {
        Overlay {
            path: PathBuf::from(format!("/tmp/ovl{}.qcow2", id)),
            device: crate::overlay::device_name(id),
            source: SourceDisk {
                uri: format!("/src/disk{}.img", id),
                format: Some("raw".to_string()),
                id,
                controller: ControllerKind::Ide,
            },
            virtual_size,
            stats: RefCell::new(OverlayStats::default()),
        }
    }

    fn mount(fs_type: &str, bsize: u64, blocks: u64, bfree: u64) -> MountStats {
        MountStats {
            device: "/dev/sda1".to_string(),
            mountpoint: "/".to_string(),
            fs_type: fs_type.to_string(),
            stats: FsStats {
                bsize,
                blocks,
                bfree,
                bavail: bfree,
                files: 1,
                ffree: 1,
            },
        }
    }

    #[test]
    fn test_single_disk_half_free() {
        // 2 GiB disk fully covered by an ext4 filesystem with 1 GiB
        // free: the estimate halves.
        let overlays = vec![overlay(0, 2 * GIB)];
        let mounts = vec![mount("ext4", 4096, 2 * GIB / 4096, GIB / 4096)];
        estimate_target_sizes(&mounts, &overlays);
        assert_eq!(overlays[0].stats.borrow().estimated_size, Some(GIB));
    }

    #[test]
    fn test_ntfs_contributes_no_saving() {
        let overlays = vec![overlay(0, 2 * GIB)];
        let mounts = vec![mount("ntfs", 4096, 2 * GIB / 4096, GIB / 4096)];
        estimate_target_sizes(&mounts, &overlays);
        assert_eq!(overlays[0].stats.borrow().estimated_size, Some(2 * GIB));
    }

    #[test]
    fn test_zero_src_total_leaves_estimates_unset() {
        let overlays: Vec<Overlay> = vec![];
        let mounts = vec![mount("ext4", 4096, 1024, 512)];
        estimate_target_sizes(&mounts, &overlays);
        // Nothing to assert on an empty list beyond "no panic"; also
        // check a populated mount list with no overlays is harmless.
        assert!(overlays.is_empty());
    }

    #[test]
    fn test_estimates_never_exceed_virtual_size() {
        let overlays = vec![overlay(0, GIB), overlay(1, 3 * GIB)];
        let mounts = vec![
            mount("ext4", 4096, 3 * GIB / 4096, 2 * GIB / 4096),
            mount("xfs", 4096, GIB / 4096, GIB / 8192),
        ];
        estimate_target_sizes(&mounts, &overlays);
        for ov in &overlays {
            let est = ov.stats.borrow().estimated_size.unwrap();
            assert!(est <= ov.virtual_size);
        }
    }

    #[test]
    fn test_estimate_sum_bounded_by_src_total() {
        let overlays = vec![overlay(0, GIB), overlay(1, 2 * GIB), overlay(2, 512 * 1024 * 1024)];
        let mounts = vec![
            mount("ext4", 4096, 2 * GIB / 4096, GIB / 4096),
            mount("ext3", 1024, GIB / 1024, GIB / 2048),
        ];
        estimate_target_sizes(&mounts, &overlays);
        let src_total: u64 = overlays.iter().map(|ov| ov.virtual_size).sum();
        let est_total: u64 = overlays
            .iter()
            .map(|ov| ov.stats.borrow().estimated_size.unwrap())
            .sum();
        assert!(est_total <= src_total);
    }

    #[test]
    fn test_saving_apportioned_by_virtual_size() {
        let overlays = vec![overlay(0, GIB), overlay(1, GIB)];
        let mounts = vec![mount("ext4", 4096, GIB / 4096, GIB / 8192)];
        estimate_target_sizes(&mounts, &overlays);
        let a = overlays[0].stats.borrow().estimated_size.unwrap();
        let b = overlays[1].stats.borrow().estimated_size.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_estimate_human() {
        let out = render_estimate(&[100, 200], false).unwrap();
        assert_eq!(out, "disk 1: 100\ndisk 2: 200\ntotal: 300\n");
    }

    #[test]
    fn test_render_estimate_json() {
        let out = render_estimate(&[100, 200], true).unwrap();
        assert_eq!(
            out,
            "{\n  \"disks\": [\n    100,\n    200\n  ],\n  \"total\": 300\n}\n"
        );
    }
}
