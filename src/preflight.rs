// src/preflight.rs

//! Host preflight checks
//!
//! Cheap checks that run before any long operation: the temporary
//! directory that will hold the overlays and the appliance image
//! must have headroom, and the external tools the pipeline shells
//! out to must exist.

use crate::error::{Error, Result};
use crate::qemuimg;
use nix::sys::statvfs::statvfs;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Minimum free space required in the large temporary directory.
///
/// Folds in the appliance image; a heuristic, not a measurement.
pub const MIN_TMP_FREE: u64 = 1024 * 1024 * 1024;

/// Environment variable that relocates the large temporary directory
pub const TMPDIR_ENV: &str = "VIRTSHIFT_TMPDIR";

/// Directory for overlays and the appliance image.
///
/// `VIRTSHIFT_TMPDIR` wins; otherwise the appliance cache directory
/// is reused, falling back to /var/tmp.
pub fn large_tmpdir() -> PathBuf {
    if let Ok(dir) = env::var(TMPDIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("LIBGUESTFS_CACHEDIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/tmp")
}

/// Free bytes available to unprivileged writers on the filesystem
/// holding `path`
pub fn free_space(path: &Path) -> Result<u64> {
    let stat = statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Check the temporary directory has room for overlays and the
/// appliance
pub fn check_host_free_space(tmpdir: &Path) -> Result<()> {
    let available = free_space(tmpdir)?;
    debug!(
        "host free space in {}: {} bytes",
        tmpdir.display(),
        available
    );
    if available < MIN_TMP_FREE {
        return Err(Error::NoSpace {
            path: tmpdir.to_path_buf(),
            needed: MIN_TMP_FREE,
            available,
        });
    }
    Ok(())
}

/// Check the external tools the pipeline needs are installed
pub fn check_tools() -> Result<()> {
    if !qemuimg::available() {
        return Err(Error::MissingTool("qemu-img".to_string()));
    }
    Ok(())
}
