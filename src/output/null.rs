// src/output/null.rs

//! Null output
//!
//! Discards everything: disks are copied into throwaway files in the
//! temporary directory and no metadata is written. Useful to test
//! that a conversion would succeed without committing to a target.

use super::OutputAdapter;
use crate::convert::GrantedCaps;
use crate::error::Result;
use crate::inspect::Inspect;
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::Source;
use crate::target::{TargetBusAssignment, TargetDisk, TargetFile, TargetFirmware};
use std::path::{Path, PathBuf};
use tracing::info;

pub struct NullOutput {
    dir: PathBuf,
}

impl NullOutput {
    pub fn new(tmpdir: impl Into<PathBuf>) -> Self {
        Self { dir: tmpdir.into() }
    }
}

impl OutputAdapter for NullOutput {
    fn precheck(&self) -> Result<()> {
        Ok(())
    }

    fn as_options(&self) -> String {
        "-o null".to_string()
    }

    fn supported_firmware(&self) -> Vec<TargetFirmware> {
        vec![TargetFirmware::Bios, TargetFirmware::Uefi]
    }

    fn override_output_format(&self, _overlay: &Overlay) -> Option<String> {
        // Nothing is kept, so the cheapest format wins.
        Some("qcow2".to_string())
    }

    fn prepare_targets(
        &self,
        name: &str,
        planned: &[(String, &Overlay)],
        _caps: &GrantedCaps,
    ) -> Result<Vec<TargetFile>> {
        Ok(planned
            .iter()
            .map(|(_, ov)| {
                TargetFile::File(self.dir.join(format!(".{}-{}.null", name, ov.device)))
            })
            .collect())
    }

    fn disk_create(
        &self,
        path: &Path,
        format: &str,
        size: u64,
        _preallocation: Option<&str>,
        compat: Option<&str>,
    ) -> Result<()> {
        qemuimg::create_blank(path, format, size, None, compat)
    }

    fn create_metadata(
        &self,
        source: &Source,
        targets: &[TargetDisk],
        _buses: &TargetBusAssignment,
        _caps: &GrantedCaps,
        _inspect: &Inspect,
        _firmware: TargetFirmware,
    ) -> Result<()> {
        info!("null output: discarding conversion of '{}'", source.name);
        for target in targets {
            if let TargetFile::File(path) = &target.file {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }
}
