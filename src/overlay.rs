// src/overlay.rs

//! Copy-on-write overlays over the source disks
//!
//! In copying mode every source disk is shielded by a freshly created
//! qcow2 overlay whose backing file is the source's URI. The guest
//! appliance mounts the overlays read/write, so inspection, driver
//! injection and fstrim all land in the overlay while the source
//! stays pristine. Overlays live in the configured large temporary
//! directory and are deleted on exit unless the user asked to keep
//! them.

use crate::error::{Error, Result};
use crate::qemuimg;
use crate::source::SourceDisk;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sizes attached to an overlay as the pipeline learns them
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayStats {
    /// Upper bound on the target size computed by the estimator
    pub estimated_size: Option<u64>,
    /// Bytes the copied target actually occupies
    pub actual_size: Option<u64>,
}

/// A qcow2 copy-on-write overlay over one source disk
#[derive(Debug)]
pub struct Overlay {
    /// Path of the overlay file in the temporary directory
    pub path: PathBuf,
    /// Device name the disk gets inside the appliance (`sda`, `sdb`, ...)
    pub device: String,
    /// The source disk this overlay shields
    pub source: SourceDisk,
    /// Virtual size of the backing disk in bytes, always > 0
    pub virtual_size: u64,
    /// Updated long after creation, first by the estimator and then
    /// by the copy engine
    pub stats: RefCell<OverlayStats>,
}

/// Map a disk index to its appliance device name.
///
/// The sequence is `sda`..`sdz`, then `sdaa`, `sdab`, ... -- base 26
/// with a leading-letter shift, so `sdz` is followed by `sdaa`, not
/// `sdba`. Conversion modules rely on these exact names when they
/// remap devices in the guest's boot configuration.
pub fn device_name(index: usize) -> String {
    let mut letters = Vec::new();
    let mut i = index;
    loop {
        letters.push(b'a' + (i % 26) as u8);
        if i < 26 {
            break;
        }
        i = i / 26 - 1;
    }
    letters.reverse();
    let mut name = String::from("sd");
    name.extend(letters.into_iter().map(char::from));
    name
}

/// Create one overlay per source disk.
///
/// Overlay files are created in `tmpdir`; the caller is responsible
/// for registering them for deletion on exit.
pub fn create_overlays(tmpdir: &Path, disks: &[SourceDisk]) -> Result<Vec<Overlay>> {
    let mut overlays = Vec::with_capacity(disks.len());
    for (i, disk) in disks.iter().enumerate() {
        overlays.push(create_overlay(tmpdir, disk, i)?);
    }
    Ok(overlays)
}

fn create_overlay(tmpdir: &Path, disk: &SourceDisk, index: usize) -> Result<Overlay> {
    let tmp = tempfile::Builder::new()
        .prefix("vsovl")
        .suffix(".qcow2")
        .tempfile_in(tmpdir)
        .map_err(|e| {
            Error::Overlay(format!(
                "cannot create overlay in {}: {}",
                tmpdir.display(),
                e
            ))
        })?;
    let path = tmp.into_temp_path().keep().map_err(|e| e.error)?;

    qemuimg::create_overlay(&path, &disk.uri, disk.format.as_deref())?;

    // Re-read the overlay: it must have a backing file and a
    // non-zero virtual size before anything mounts it.
    let ovl_info = qemuimg::info(path_str(&path)?)?;
    if !ovl_info.has_backing_file() {
        return Err(Error::Overlay(format!(
            "overlay {} has no backing file",
            path.display()
        )));
    }

    let virtual_size = ovl_info.virtual_size;
    if virtual_size == 0 {
        return Err(Error::Overlay(format!(
            "disk {} ({}) has a virtual size of 0 bytes. If the source is a block \
             device accessed over ssh, the remote server may not support \
             detecting its size",
            disk.id, disk.uri
        )));
    }

    let device = device_name(index);
    debug!(
        "overlay {} -> {} ({} bytes) as {}",
        disk.uri,
        path.display(),
        virtual_size,
        device
    );

    Ok(Overlay {
        path,
        device,
        source: disk.clone(),
        virtual_size,
        stats: RefCell::new(OverlayStats::default()),
    })
}

/// Log the overlay locations for `--debug-overlays` runs
pub fn report_preserved(overlays: &[Overlay]) {
    for ov in overlays {
        info!(
            "overlay for disk {} preserved at {}",
            ov.source.id,
            ov.path.display()
        );
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::other(format!("non-UTF8 path: {}", path.display())))
}
