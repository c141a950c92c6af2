// src/copy.rs

//! The copy engine
//!
//! Copies each overlay to its destination, one disk at a time so the
//! transfer link and the target storage are never oversubscribed.
//! Every created target file is registered with the cleanup guard
//! before it exists, so a failure anywhere in the loop leaves no
//! partial targets behind.

use crate::error::{Error, Result};
use crate::guard::{is_block_device, CleanupGuard};
use crate::output::OutputAdapter;
use crate::progress::ProgressTracker;
use crate::qemuimg;
use crate::target::{Allocation, TargetDisk, TargetFile};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, info};

/// Bytes a file actually occupies on disk
fn allocated_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.blocks() * 512)
}

/// Copy all planned targets in order.
///
/// For each disk: sanity-check the overlay, pre-create the
/// destination through the output adapter (unless it is a block
/// device or a URI), stream the overlay across, measure the result
/// and notify the adapter. Disk *i+1* never starts before disk *i*'s
/// notification returned.
pub fn copy_disks(
    targets: &[TargetDisk],
    output: &dyn OutputAdapter,
    guard: &mut CleanupGuard,
    compressed: bool,
    allocation: Option<Allocation>,
    progress: &dyn ProgressTracker,
) -> Result<()> {
    let total = targets.len();
    for (index, target) in targets.iter().enumerate() {
        progress.set_message(&format!(
            "Copying disk {}/{} ({})",
            index + 1,
            total,
            target.overlay.device
        ));

        // The overlay was created long before we got here; make sure
        // nothing corrupted its backing chain in the meantime.
        let overlay_path = target.overlay.path.to_str().ok_or_else(|| {
            Error::other(format!("non-UTF8 path: {}", target.overlay.path.display()))
        })?;
        let info = qemuimg::info(overlay_path)?;
        if !info.has_backing_file() {
            return Err(Error::Overlay(format!(
                "overlay {} lost its backing file",
                target.overlay.path.display()
            )));
        }

        if let TargetFile::File(path) = &target.file {
            if !is_block_device(path) {
                guard.register(path.clone());
                let compat = if target.format == "qcow2" {
                    Some("1.1")
                } else {
                    None
                };
                output.disk_create(
                    path,
                    &target.format,
                    target.overlay.virtual_size,
                    allocation.map(|a| a.preallocation()),
                    compat,
                )?;
            } else {
                debug!("target {} is a block device, not creating", path.display());
            }
        }

        let transfer_format = output.transfer_format(target);
        let destination = target.file.location()?;
        info!(
            "copying disk {}/{} to {} ({})",
            index + 1,
            total,
            destination,
            transfer_format
        );
        qemuimg::convert(&target.overlay.path, &destination, &transfer_format, compressed)?;

        if let TargetFile::File(path) = &target.file {
            if !is_block_device(path) {
                let actual = allocated_size(path)?;
                let mut stats = target.overlay.stats.borrow_mut();
                stats.actual_size = Some(actual);
                match stats.estimated_size {
                    Some(estimated) => debug!(
                        "disk {}: estimated {} bytes, copied {} bytes",
                        index + 1,
                        estimated,
                        actual
                    ),
                    None => debug!("disk {}: copied {} bytes", index + 1, actual),
                }
            }
        }

        output.disk_copied(target, index, total)?;
        progress.increment(1);
    }
    progress.finish_with_message(&format!("Copied {} disks", total));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::CleanupGuard;
    use crate::output::tests::RecordingOutput;
    use crate::overlay::{create_overlays, Overlay, OverlayStats};
    use crate::progress::SilentProgress;
    use crate::source::{ControllerKind, SourceDisk};
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[test]
    fn test_allocated_size_of_small_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, vec![1u8; 8192]).unwrap();
        assert!(allocated_size(&path).unwrap() >= 8192);
    }

    #[test]
    fn test_copy_fails_on_overlay_without_backing_file() {
        if !crate::qemuimg::available() {
            return;
        }
        let dir = tempdir().unwrap();
        // A standalone qcow2, not an overlay: the sanity check must
        // refuse to copy it.
        let bogus = dir.path().join("standalone.qcow2");
        crate::qemuimg::create_blank(&bogus, "qcow2", 1024 * 1024, None, Some("1.1")).unwrap();

        let target = TargetDisk {
            file: TargetFile::File(dir.path().join("out.img")),
            format: "raw".into(),
            overlay: Overlay {
                path: bogus,
                device: "sda".into(),
                source: SourceDisk {
                    uri: "/irrelevant".into(),
                    format: Some("raw".into()),
                    id: 0,
                    controller: ControllerKind::Ide,
                },
                virtual_size: 1024 * 1024,
                stats: RefCell::new(OverlayStats::default()),
            },
        };
        let output = RecordingOutput::in_dir(dir.path());
        let mut guard = CleanupGuard::new();
        let err = copy_disks(
            std::slice::from_ref(&target),
            &output,
            &mut guard,
            false,
            None,
            &SilentProgress::new(),
        )
        .unwrap_err();
        guard.disarm();
        assert!(matches!(err, Error::Overlay(_)));
        assert!(output.created.borrow().is_empty());
    }

    #[test]
    fn test_copy_single_disk_end_to_end() {
        if !crate::qemuimg::available() {
            return;
        }
        let dir = tempdir().unwrap();
        let backing = dir.path().join("disk0.img");
        std::fs::write(&backing, vec![0u8; 1024 * 1024]).unwrap();
        let disk = SourceDisk {
            uri: backing.to_str().unwrap().to_string(),
            format: Some("raw".into()),
            id: 0,
            controller: ControllerKind::Ide,
        };
        let overlay = create_overlays(dir.path(), std::slice::from_ref(&disk))
            .unwrap()
            .remove(0);
        let overlay_path = overlay.path.clone();
        let destination = dir.path().join("out.raw");
        let target = TargetDisk {
            file: TargetFile::File(destination.clone()),
            format: "raw".into(),
            overlay,
        };

        let output = RecordingOutput::in_dir(dir.path());
        let mut guard = CleanupGuard::new();
        copy_disks(
            std::slice::from_ref(&target),
            &output,
            &mut guard,
            false,
            None,
            &SilentProgress::new(),
        )
        .unwrap();
        guard.disarm();

        assert!(destination.exists());
        assert_eq!(*output.copied.borrow(), vec![0]);
        assert!(target.overlay.stats.borrow().actual_size.is_some());
        std::fs::remove_file(overlay_path).ok();
    }
}
