// src/source.rs

//! Source guest model
//!
//! The source model is the immutable description of the guest as read
//! from the input adapter: hardware inventory, firmware hint and the
//! list of disks to convert. `open_source` validates the model and
//! applies the command-line overrides (rename, network remapping)
//! before the rest of the pipeline sees it.

use crate::error::{Error, Result};
use crate::input::InputAdapter;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Hypervisor the source guest was running under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hypervisor {
    VMware,
    Xen,
    HyperV,
    VirtualBox,
    Kvm,
    Other(String),
}

impl Hypervisor {
    pub fn as_str(&self) -> &str {
        match self {
            Self::VMware => "vmware",
            Self::Xen => "xen",
            Self::HyperV => "hyperv",
            Self::VirtualBox => "virtualbox",
            Self::Kvm => "kvm",
            Self::Other(s) => s,
        }
    }
}

/// Disk controller the source attached a disk to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerKind {
    Ide,
    Sata,
    VirtioBlk,
    VirtioScsi,
    Other(String),
}

impl ControllerKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ide => "ide",
            Self::Sata => "sata",
            Self::VirtioBlk => "virtio-blk",
            Self::VirtioScsi => "virtio-scsi",
            Self::Other(s) => s,
        }
    }
}

/// Network device model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetBus {
    E1000,
    Rtl8139,
    VirtioNet,
}

impl NetBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E1000 => "e1000",
            Self::Rtl8139 => "rtl8139",
            Self::VirtioNet => "virtio",
        }
    }
}

/// Video adapter model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Video {
    Qxl,
    Vga,
}

impl Video {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qxl => "qxl",
            Self::Vga => "vga",
        }
    }
}

/// Firmware the source claims to boot with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareHint {
    Bios,
    Uefi,
    Unknown,
}

impl FirmwareHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Uefi => "uefi",
            Self::Unknown => "unknown",
        }
    }
}

/// CPU socket/core/thread layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

/// Network interface on the source guest
#[derive(Debug, Clone)]
pub struct Nic {
    pub mac: Option<String>,
    /// Name of the source network or bridge the NIC was plugged into
    pub network: String,
    pub model: Option<NetBus>,
}

/// Removable device kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovableKind {
    Cdrom,
    Floppy,
}

impl RemovableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cdrom => "cdrom",
            Self::Floppy => "floppy",
        }
    }
}

/// Removable device on the source guest
#[derive(Debug, Clone)]
pub struct Removable {
    pub kind: RemovableKind,
}

/// Immutable description of the source guest
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    /// Name before any `--name` rename was applied
    pub orig_name: Option<String>,
    pub hypervisor: Hypervisor,
    /// Memory in bytes
    pub memory: u64,
    pub vcpu: u32,
    pub topology: Option<CpuTopology>,
    pub cpu_vendor: Option<String>,
    pub cpu_model: Option<String>,
    pub nics: Vec<Nic>,
    pub removables: Vec<Removable>,
    pub video: Option<Video>,
    pub firmware: FirmwareHint,
}

/// One disk of the source guest
///
/// The URI is opaque to the pipeline; it only has to be openable by
/// qemu-img (a local path, an nbd:// URL, a json:{} pseudo-URL, ...).
#[derive(Debug, Clone)]
pub struct SourceDisk {
    pub uri: String,
    /// Format declared by the source metadata, if any
    pub format: Option<String>,
    /// Positional id, unique across the source
    pub id: usize,
    pub controller: ControllerKind,
}

/// Mapping from source network names to target network names
#[derive(Debug, Clone, Default)]
pub struct NetworkMap {
    map: BTreeMap<String, String>,
    default: Option<String>,
}

impl NetworkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse repeated `--network-map` arguments.
    ///
    /// Each entry is `IN:OUT`; an entry without a colon sets the
    /// default target network for unmatched source networks.
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut nm = Self::new();
        for entry in entries {
            match entry.split_once(':') {
                Some((from, to)) => {
                    if from.is_empty() || to.is_empty() {
                        return Err(Error::other(format!(
                            "invalid network mapping '{}', expected IN:OUT",
                            entry
                        )));
                    }
                    nm.map.insert(from.to_string(), to.to_string());
                }
                None => {
                    if entry.is_empty() {
                        return Err(Error::other("empty network mapping"));
                    }
                    nm.default = Some(entry.clone());
                }
            }
        }
        Ok(nm)
    }

    /// Resolve a source network name to the target network name
    pub fn resolve(&self, network: &str) -> String {
        if let Some(to) = self.map.get(network) {
            return to.clone();
        }
        match &self.default {
            Some(d) => d.clone(),
            None => network.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.default.is_none()
    }
}

/// Read the source from the input adapter, validate it, and apply
/// command-line overrides.
pub fn open_source(
    input: &dyn InputAdapter,
    bandwidth: Option<u64>,
    rename: Option<&str>,
    network_map: &NetworkMap,
) -> Result<(Source, Vec<SourceDisk>)> {
    let (mut source, disks) = input.source(bandwidth)?;
    debug!("opened source '{}' from {}", source.name, input.as_options());

    validate(&source, &disks)?;

    if let Some(name) = rename {
        source.orig_name = Some(std::mem::replace(&mut source.name, name.to_string()));
    }
    if !network_map.is_empty() {
        for nic in &mut source.nics {
            let mapped = network_map.resolve(&nic.network);
            if mapped != nic.network {
                debug!("NIC network '{}' mapped to '{}'", nic.network, mapped);
                nic.network = mapped;
            }
        }
    }

    Ok((source, disks))
}

fn validate(source: &Source, disks: &[SourceDisk]) -> Result<()> {
    if source.name.is_empty() {
        return Err(Error::InvalidSource("guest name is empty".into()));
    }
    if source.memory == 0 {
        return Err(Error::InvalidSource("guest memory size is zero".into()));
    }
    if source.vcpu == 0 {
        return Err(Error::InvalidSource("guest has no vCPUs".into()));
    }

    let mut seen = HashSet::new();
    for disk in disks {
        if disk.uri.is_empty() {
            return Err(Error::InvalidSource(format!(
                "disk {} has an empty location",
                disk.id
            )));
        }
        if !seen.insert(disk.id) {
            return Err(Error::InvalidSource(format!(
                "duplicate disk id {}",
                disk.id
            )));
        }
    }

    if let Hypervisor::Other(tag) = &source.hypervisor {
        warn!("unknown source hypervisor '{}'; conversion may misbehave", tag);
    }
    if let Some(t) = &source.topology {
        if t.sockets == 0 || t.cores == 0 || t.threads == 0 {
            return Err(Error::InvalidSource("CPU topology contains a zero field".into()));
        }
        let product = t.sockets as u64 * t.cores as u64 * t.threads as u64;
        if product != source.vcpu as u64 {
            warn!(
                "CPU topology ({} sockets x {} cores x {} threads) does not match {} vCPUs",
                t.sockets, t.cores, t.threads, source.vcpu
            );
        }
    }
    for s in [&source.cpu_vendor, &source.cpu_model].into_iter().flatten() {
        if s.is_empty() {
            return Err(Error::InvalidSource("empty CPU vendor or model string".into()));
        }
    }

    Ok(())
}

/// Render the source for `--print-source`.
///
/// The rendering is deterministic: the same source always produces
/// byte-identical output.
pub fn render_source(source: &Source, disks: &[SourceDisk]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "source name: {}", source.name);
    if let Some(orig) = &source.orig_name {
        let _ = writeln!(out, "original name: {}", orig);
    }
    let _ = writeln!(out, "hypervisor type: {}", source.hypervisor.as_str());
    let _ = writeln!(out, "memory: {} (bytes)", source.memory);
    let _ = writeln!(out, "nr vCPUs: {}", source.vcpu);
    match &source.topology {
        Some(t) => {
            let _ = writeln!(
                out,
                "CPU topology: sockets: {}, cores/socket: {}, threads/core: {}",
                t.sockets, t.cores, t.threads
            );
        }
        None => {
            let _ = writeln!(out, "CPU topology: -");
        }
    }
    let _ = writeln!(out, "CPU vendor: {}", source.cpu_vendor.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "CPU model: {}", source.cpu_model.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "firmware: {}", source.firmware.as_str());
    let _ = writeln!(
        out,
        "video: {}",
        source.video.map(|v| v.as_str()).unwrap_or("-")
    );
    let _ = writeln!(out, "disks:");
    for disk in disks {
        let _ = writeln!(
            out,
            "\t{}: \"{}\" ({}) [{}]",
            disk.id,
            disk.uri,
            disk.format.as_deref().unwrap_or("autodetect"),
            disk.controller.as_str()
        );
    }
    let _ = writeln!(out, "removable media:");
    for rem in &source.removables {
        let _ = writeln!(out, "\t{}", rem.kind.as_str());
    }
    let _ = writeln!(out, "NICs:");
    for nic in &source.nics {
        let _ = writeln!(
            out,
            "\t{} network \"{}\" [{}]",
            nic.mac.as_deref().unwrap_or("-"),
            nic.network,
            nic.model.map(|m| m.as_str()).unwrap_or("-")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> Source {
        Source {
            name: "vm1".to_string(),
            orig_name: None,
            hypervisor: Hypervisor::VMware,
            memory: 1024 * 1024 * 1024,
            vcpu: 1,
            topology: None,
            cpu_vendor: None,
            cpu_model: None,
            nics: vec![Nic {
                mac: Some("52:54:00:12:34:56".to_string()),
                network: "VM Network".to_string(),
                model: Some(NetBus::E1000),
            }],
            removables: vec![],
            video: None,
            firmware: FirmwareHint::Unknown,
        }
    }

    fn sample_disk(id: usize) -> SourceDisk {
        SourceDisk {
            uri: format!("/var/tmp/disk{}.img", id),
            format: Some("raw".to_string()),
            id,
            controller: ControllerKind::Ide,
        }
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(validate(&sample_source(), &[sample_disk(0), sample_disk(1)]).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut src = sample_source();
        src.name.clear();
        assert!(matches!(
            validate(&src, &[]),
            Err(Error::InvalidSource(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_memory() {
        let mut src = sample_source();
        src.memory = 0;
        assert!(validate(&src, &[]).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_disk_ids() {
        let disks = vec![sample_disk(0), sample_disk(0)];
        assert!(validate(&sample_source(), &disks).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_uri() {
        let mut disk = sample_disk(0);
        disk.uri.clear();
        assert!(validate(&sample_source(), &[disk]).is_err());
    }

    #[test]
    fn test_topology_mismatch_is_not_fatal() {
        let mut src = sample_source();
        src.vcpu = 4;
        src.topology = Some(CpuTopology {
            sockets: 1,
            cores: 2,
            threads: 1,
        });
        assert!(validate(&src, &[]).is_ok());
    }

    #[test]
    fn test_network_map_explicit_and_default() {
        let nm = NetworkMap::parse(&[
            "VM Network:default".to_string(),
            "fallback".to_string(),
        ])
        .unwrap();
        assert_eq!(nm.resolve("VM Network"), "default");
        assert_eq!(nm.resolve("other"), "fallback");
    }

    #[test]
    fn test_network_map_passthrough_without_default() {
        let nm = NetworkMap::parse(&["a:b".to_string()]).unwrap();
        assert_eq!(nm.resolve("c"), "c");
    }

    #[test]
    fn test_network_map_rejects_half_empty_entry() {
        assert!(NetworkMap::parse(&[":x".to_string()]).is_err());
        assert!(NetworkMap::parse(&["x:".to_string()]).is_err());
    }

    #[test]
    fn test_render_source_is_deterministic() {
        let src = sample_source();
        let disks = vec![sample_disk(0)];
        assert_eq!(render_source(&src, &disks), render_source(&src, &disks));
    }

    #[test]
    fn test_render_source_lists_disks() {
        let rendered = render_source(&sample_source(), &[sample_disk(0)]);
        assert!(rendered.contains("source name: vm1"));
        assert!(rendered.contains("0: \"/var/tmp/disk0.img\" (raw) [ide]"));
    }
}
