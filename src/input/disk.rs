// src/input/disk.rs

//! Local disk image input
//!
//! Takes one or more local image paths and synthesizes a source
//! around them: the guest is named after the first image, gets one
//! NIC on the default network and conservative virtual hardware.
//! Formats are probed with qemu-img, never guessed from file
//! extensions.

use super::InputAdapter;
use crate::error::{Error, Result};
use crate::qemuimg;
use crate::source::{
    ControllerKind, FirmwareHint, Hypervisor, NetBus, Nic, Source, SourceDisk,
};
use std::path::PathBuf;
use tracing::{debug, warn};

const DEFAULT_MEMORY: u64 = 2048 * 1024 * 1024;

pub struct DiskInput {
    paths: Vec<PathBuf>,
}

impl DiskInput {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl InputAdapter for DiskInput {
    fn precheck(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::other(
                "disk input requires at least one disk image argument",
            ));
        }
        for path in &self.paths {
            if !path.exists() {
                return Err(Error::other(format!(
                    "disk image {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn as_options(&self) -> String {
        let paths: Vec<String> = self
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!("-i disk {}", paths.join(" "))
    }

    fn source(&self, bandwidth: Option<u64>) -> Result<(Source, Vec<SourceDisk>)> {
        if bandwidth.is_some() {
            warn!("disk input reads local files; the bandwidth limit is ignored");
        }

        let name = self
            .paths
            .first()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::other("cannot derive a guest name from the disk path"))?;

        let mut disks = Vec::with_capacity(self.paths.len());
        for (id, path) in self.paths.iter().enumerate() {
            // Overlays resolve their backing file relative to the
            // overlay's own directory, so the URI must be absolute.
            let path = std::fs::canonicalize(path)?;
            let uri = path
                .to_str()
                .ok_or_else(|| Error::other(format!("non-UTF8 path: {}", path.display())))?
                .to_string();
            let info = qemuimg::info(&uri)?;
            debug!(
                "disk {}: {} ({} bytes, {})",
                id,
                uri,
                info.virtual_size,
                info.format.as_deref().unwrap_or("unknown format")
            );
            disks.push(SourceDisk {
                uri,
                format: info.format,
                id,
                controller: ControllerKind::Ide,
            });
        }

        let source = Source {
            name,
            orig_name: None,
            hypervisor: Hypervisor::Other("disk".to_string()),
            memory: DEFAULT_MEMORY,
            vcpu: 1,
            topology: None,
            cpu_vendor: None,
            cpu_model: None,
            nics: vec![Nic {
                mac: None,
                network: "default".to_string(),
                model: Some(NetBus::E1000),
            }],
            removables: vec![],
            video: None,
            firmware: FirmwareHint::Unknown,
        };
        Ok((source, disks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precheck_rejects_empty_list() {
        assert!(DiskInput::new(vec![]).precheck().is_err());
    }

    #[test]
    fn test_precheck_rejects_missing_file() {
        let input = DiskInput::new(vec![PathBuf::from("/nonexistent/disk.img")]);
        assert!(input.precheck().is_err());
    }

    #[test]
    fn test_source_probes_disks() {
        if !qemuimg::available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("guest.img");
        std::fs::write(&img, vec![0u8; 512 * 1024]).unwrap();

        let input = DiskInput::new(vec![img]);
        input.precheck().unwrap();
        let (source, disks) = input.source(None).unwrap();
        assert_eq!(source.name, "guest");
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].id, 0);
        assert_eq!(disks[0].format.as_deref(), Some("raw"));
    }
}
