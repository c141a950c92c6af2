// src/guard.rs

//! Exit-time cleanup
//!
//! The pipeline creates files it must not leave behind: overlays are
//! always temporary, and partially copied target disks must vanish
//! when a conversion fails. Cleanup is owned by a scope guard rather
//! than a process-global flag: the guard unlinks its registered
//! paths when dropped, on every exit path, unless it was explicitly
//! disarmed. The copy engine disarms the target guard only after
//! metadata emission succeeds.
//!
//! Cleanup errors are swallowed so the user-visible failure is
//! always the first real error, not a secondary unlink problem.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scope guard that unlinks registered paths on drop
#[derive(Debug, Default)]
pub struct CleanupGuard {
    paths: Vec<PathBuf>,
    disarmed: bool,
}

/// Whether the path is a block device (or a symlink to one).
///
/// Pre-existing block devices are never unlinked: deleting the
/// device node would not reclaim the partial copy anyway.
pub fn is_block_device(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.file_type().is_block_device(),
        Err(_) => false,
    }
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path for deletion when the guard drops
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!("registered {} for cleanup on exit", path.display());
        self.paths.push(path);
    }

    /// Keep the registered paths; call after the pipeline has
    /// committed to its outputs
    pub fn disarm(&mut self) {
        debug!("cleanup guard disarmed");
        self.disarmed = true;
    }

    pub fn is_armed(&self) -> bool {
        !self.disarmed
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        for path in &self.paths {
            if is_block_device(path) {
                continue;
            }
            // Unlink errors are swallowed: the user-visible failure
            // must stay the first real error.
            if fs::remove_file(path).is_ok() {
                debug!("removed {}", path.display());
            }
        }
    }
}
