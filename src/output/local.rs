// src/output/local.rs

//! Local directory output
//!
//! Writes the converted disks as plain files into a directory and
//! emits a libvirt domain XML next to them. The XML is intentionally
//! minimal: enough to `virsh define` the converted guest and boot
//! it, with device models picked from the granted capabilities.

use super::OutputAdapter;
use crate::convert::GrantedCaps;
use crate::error::{Error, Result};
use crate::inspect::Inspect;
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::Source;
use crate::target::{
    BusSlot, TargetBusAssignment, TargetDisk, TargetFile, TargetFirmware,
};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const OVMF_CODE: &str = "/usr/share/OVMF/OVMF_CODE.fd";

/// Output adapter writing disks and metadata to a local directory
pub struct LocalOutput {
    dir: PathBuf,
}

impl LocalOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn xml_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.xml", name))
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

impl OutputAdapter for LocalOutput {
    fn precheck(&self) -> Result<()> {
        let meta = fs::metadata(&self.dir).map_err(|_| {
            Error::Output(format!(
                "output directory {} does not exist",
                self.dir.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(Error::Output(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn as_options(&self) -> String {
        format!("-o local --output-storage {}", self.dir.display())
    }

    fn supported_firmware(&self) -> Vec<TargetFirmware> {
        vec![TargetFirmware::Bios, TargetFirmware::Uefi]
    }

    fn prepare_targets(
        &self,
        name: &str,
        planned: &[(String, &Overlay)],
        _caps: &GrantedCaps,
    ) -> Result<Vec<TargetFile>> {
        Ok(planned
            .iter()
            .map(|(_, ov)| TargetFile::File(self.dir.join(format!("{}-{}", name, ov.device))))
            .collect())
    }

    fn disk_create(
        &self,
        path: &Path,
        format: &str,
        size: u64,
        preallocation: Option<&str>,
        compat: Option<&str>,
    ) -> Result<()> {
        // Map the adapter-level policy onto qemu-img's preallocation
        // modes; "full" uses falloc which is fast and fully reserves
        // the space.
        let preallocation = match preallocation {
            Some("sparse") => Some("off"),
            Some("full") => Some("falloc"),
            Some(other) => {
                return Err(Error::Output(format!(
                    "unknown preallocation mode '{}'",
                    other
                )))
            }
            None => None,
        };
        qemuimg::create_blank(path, format, size, preallocation, compat)
    }

    fn create_metadata(
        &self,
        source: &Source,
        targets: &[TargetDisk],
        buses: &TargetBusAssignment,
        caps: &GrantedCaps,
        _inspect: &Inspect,
        firmware: TargetFirmware,
    ) -> Result<()> {
        let mut xml = String::new();
        let name = xml_escape(&source.name);
        let memory_kib = source.memory / 1024;

        let _ = writeln!(xml, "<domain type='kvm'>");
        let _ = writeln!(xml, "  <name>{}</name>", name);
        let _ = writeln!(xml, "  <memory unit='KiB'>{}</memory>", memory_kib);
        match &source.topology {
            Some(t) => {
                let _ = writeln!(xml, "  <vcpu>{}</vcpu>", source.vcpu);
                let _ = writeln!(
                    xml,
                    "  <cpu><topology sockets='{}' cores='{}' threads='{}'/></cpu>",
                    t.sockets, t.cores, t.threads
                );
            }
            None => {
                let _ = writeln!(xml, "  <vcpu>{}</vcpu>", source.vcpu);
            }
        }
        let _ = writeln!(xml, "  <os>");
        let _ = writeln!(xml, "    <type arch='x86_64' machine='q35'>hvm</type>");
        if firmware == TargetFirmware::Uefi {
            let _ = writeln!(
                xml,
                "    <loader readonly='yes' type='pflash'>{}</loader>",
                OVMF_CODE
            );
        }
        let _ = writeln!(xml, "  </os>");
        let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
        let _ = writeln!(xml, "  <devices>");

        let bus = buses.bus.as_str();
        for slot in &buses.slots {
            match slot {
                BusSlot::Disk { disk_id, device } => {
                    let target = targets
                        .iter()
                        .find(|t| t.overlay.source.id == *disk_id)
                        .ok_or_else(|| {
                            Error::Internal(format!("no target for disk id {}", disk_id))
                        })?;
                    let location = match &target.file {
                        TargetFile::File(path) => path.display().to_string(),
                        TargetFile::Uri(uri) => uri.clone(),
                    };
                    let _ = writeln!(xml, "    <disk type='file' device='disk'>");
                    let _ = writeln!(
                        xml,
                        "      <driver name='qemu' type='{}'/>",
                        xml_escape(&target.format)
                    );
                    let _ = writeln!(xml, "      <source file='{}'/>", xml_escape(&location));
                    let _ = writeln!(xml, "      <target dev='{}' bus='{}'/>", device, bus);
                    let _ = writeln!(xml, "    </disk>");
                }
                BusSlot::Removable { kind, device } => {
                    let _ = writeln!(
                        xml,
                        "    <disk type='file' device='{}'>",
                        kind.as_str()
                    );
                    let _ = writeln!(xml, "      <target dev='{}' bus='{}'/>", device, bus);
                    let _ = writeln!(xml, "    </disk>");
                }
            }
        }

        for nic in &source.nics {
            let _ = writeln!(xml, "    <interface type='network'>");
            if let Some(mac) = &nic.mac {
                let _ = writeln!(xml, "      <mac address='{}'/>", xml_escape(mac));
            }
            let _ = writeln!(
                xml,
                "      <source network='{}'/>",
                xml_escape(&nic.network)
            );
            let _ = writeln!(xml, "      <model type='{}'/>", caps.net_bus.as_str());
            let _ = writeln!(xml, "    </interface>");
        }

        let _ = writeln!(xml, "    <video><model type='{}'/></video>", caps.video.as_str());
        let _ = writeln!(xml, "  </devices>");
        let _ = writeln!(xml, "</domain>");

        let path = self.xml_path(&source.name);
        fs::write(&path, xml)?;
        info!("wrote libvirt domain XML to {}", path.display());
        Ok(())
    }
}
