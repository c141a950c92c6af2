// src/output/mod.rs

//! Output adapters
//!
//! An output adapter owns everything on the target side: where the
//! copied disks land, how destination disks are created, and what
//! metadata describes the converted machine. The pipeline drives the
//! adapter through the `OutputAdapter` trait and never touches the
//! target directly.

mod local;
mod null;

pub use local::LocalOutput;
pub use null::NullOutput;

use crate::convert::GrantedCaps;
use crate::error::Result;
use crate::inspect::Inspect;
use crate::overlay::Overlay;
use crate::source::Source;
use crate::target::{TargetBusAssignment, TargetDisk, TargetFile, TargetFirmware};
use std::path::Path;

/// Contract between the pipeline and an output adapter
pub trait OutputAdapter {
    /// Validate prerequisites before any long-running work starts
    fn precheck(&self) -> Result<()>;

    /// Human description for messages
    fn as_options(&self) -> String;

    /// Firmware kinds this output can boot
    fn supported_firmware(&self) -> Vec<TargetFirmware>;

    /// Veto hook: reject a firmware/capability combination this
    /// output cannot express
    fn check_target_firmware(&self, _caps: &GrantedCaps, _firmware: TargetFirmware) -> Result<()> {
        Ok(())
    }

    /// Per-overlay output format override; takes precedence over the
    /// command line and the source's declared format
    fn override_output_format(&self, _overlay: &Overlay) -> Option<String> {
        None
    }

    /// Decide destination paths or URIs, one per planned disk
    fn prepare_targets(
        &self,
        name: &str,
        planned: &[(String, &Overlay)],
        caps: &GrantedCaps,
    ) -> Result<Vec<TargetFile>>;

    /// Create one destination disk
    fn disk_create(
        &self,
        path: &Path,
        format: &str,
        size: u64,
        preallocation: Option<&str>,
        compat: Option<&str>,
    ) -> Result<()>;

    /// Format the copier should emit for this target; may differ
    /// from the stored format when the adapter re-wraps the stream
    fn transfer_format(&self, target: &TargetDisk) -> String {
        target.format.clone()
    }

    /// Per-disk callback after the copy of `target` finished
    fn disk_copied(&self, _target: &TargetDisk, _index: usize, _total: usize) -> Result<()> {
        Ok(())
    }

    /// Emit the final machine metadata and commit the conversion
    fn create_metadata(
        &self,
        source: &Source,
        targets: &[TargetDisk],
        buses: &TargetBusAssignment,
        caps: &GrantedCaps,
        inspect: &Inspect,
        firmware: TargetFirmware,
    ) -> Result<()>;
}
