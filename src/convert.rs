// src/convert.rs

//! Guest conversion driver
//!
//! The actual OS-specific work (installing virtio drivers, rewriting
//! the bootloader, fixing services) is done by a conversion module
//! selected from an ordered registry by matching on the inspection
//! result. The driver's job is the capability negotiation around it:
//! the pipeline states which device models it would like the guest
//! to support, the module answers with the models it actually
//! managed to install drivers for, and every later device decision
//! derives from that answer.

use crate::appliance::Appliance;
use crate::error::{Error, Result};
use crate::inspect::Inspect;
use crate::output::OutputAdapter;
use crate::source::{ControllerKind, NetBus, Source, SourceDisk, Video};
use tracing::{debug, info, warn};

/// Block device model the guest can boot from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBus {
    Ide,
    VirtioBlk,
    VirtioScsi,
}

impl BlockBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ide => "ide",
            Self::VirtioBlk => "virtio",
            Self::VirtioScsi => "scsi",
        }
    }

    /// Prefix of the guest-visible device names on this bus
    pub fn device_prefix(&self) -> &'static str {
        match self {
            Self::VirtioBlk => "vd",
            Self::Ide | Self::VirtioScsi => "sd",
        }
    }
}

/// Device models the pipeline asks the conversion module to support.
///
/// In copying mode everything is `None`: the module is free to pick
/// the best models it can install drivers for. In in-place mode the
/// fields are taken from the source's current configuration, since
/// the converted guest keeps its existing devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedCaps {
    pub block_bus: Option<BlockBus>,
    pub net_bus: Option<NetBus>,
    pub video: Option<Video>,
}

impl RequestedCaps {
    /// Capabilities matching the source's current devices, for
    /// in-place conversion
    pub fn from_source(source: &Source, disks: &[SourceDisk]) -> Self {
        let block_bus = disks.first().map(|d| match &d.controller {
            ControllerKind::VirtioBlk => BlockBus::VirtioBlk,
            ControllerKind::VirtioScsi => BlockBus::VirtioScsi,
            ControllerKind::Ide | ControllerKind::Sata | ControllerKind::Other(_) => BlockBus::Ide,
        });
        let net_bus = source.nics.first().and_then(|n| n.model);
        let video = source.video;
        Self {
            block_bus,
            net_bus,
            video,
        }
    }
}

/// Device models the conversion module actually installed drivers
/// for; always fully determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantedCaps {
    pub block_bus: BlockBus,
    pub net_bus: NetBus,
    pub video: Video,
}

/// One OS-specific conversion module
pub trait ConversionModule: std::fmt::Debug {
    /// Name used in log messages
    fn name(&self) -> &'static str;

    /// Whether this module can convert the inspected guest
    fn matches(&self, inspect: &Inspect) -> bool;

    /// Convert the mounted guest and report the granted capabilities
    fn convert(
        &self,
        appliance: &mut dyn Appliance,
        inspect: &Inspect,
        disks: &[SourceDisk],
        output: &dyn OutputAdapter,
        requested: &RequestedCaps,
        static_ips: &[String],
    ) -> Result<GrantedCaps>;
}

/// Ordered list of conversion modules; first match wins
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn ConversionModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn ConversionModule>) {
        self.modules.push(module);
    }

    /// Select the module for an inspected guest
    pub fn select(&self, inspect: &Inspect) -> Result<&dyn ConversionModule> {
        for module in &self.modules {
            if module.matches(inspect) {
                debug!("selected conversion module '{}'", module.name());
                return Ok(module.as_ref());
            }
        }
        Err(Error::UnsupportedGuest(format!(
            "{} {}",
            inspect.os_type, inspect.distro
        )))
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Registry with the conversion modules compiled into this build.
///
/// OS-specific modules live in their own crates and register here
/// via `ModuleRegistry::register`.
pub fn builtin_registry() -> ModuleRegistry {
    ModuleRegistry::new()
}

/// Run the selected conversion module against the mounted guest
pub fn run_conversion(
    registry: &ModuleRegistry,
    appliance: &mut dyn Appliance,
    inspect: &Inspect,
    disks: &[SourceDisk],
    output: &dyn OutputAdapter,
    requested: &RequestedCaps,
    static_ips: &[String],
) -> Result<GrantedCaps> {
    let module = registry.select(inspect)?;
    info!(
        "converting {} {} guest with module '{}'",
        inspect.distro,
        inspect.product_name,
        module.name()
    );
    let granted = module.convert(appliance, inspect, disks, output, requested, static_ips)?;
    debug!(
        "granted capabilities: block={} net={} video={}",
        granted.block_bus.as_str(),
        granted.net_bus.as_str(),
        granted.video.as_str()
    );
    Ok(granted)
}

/// Trim the free space of every mounted filesystem.
///
/// Runs after conversion so the copy skips as much of the guest's
/// free space as possible. fstrim failures only cost copy size, so
/// they are warnings.
pub fn trim_filesystems(appliance: &mut dyn Appliance) -> Result<()> {
    let mut filesystems = appliance.mounted_filesystems()?;
    // Deepest mountpoints first: each filesystem is unmounted and
    // remounted with discard, which requires its children to have
    // been processed already.
    filesystems.sort_by_key(|fs| std::cmp::Reverse(fs.mountpoint.len()));

    for fs in &filesystems {
        if matches!(fs.fs_type.as_str(), "swap" | "unknown") {
            continue;
        }
        if let Err(e) = appliance.remount_with_discard(fs) {
            warn!("cannot remount {} with discard: {}", fs.mountpoint, e);
            continue;
        }
        match appliance.fstrim(&fs.mountpoint) {
            Ok(()) => debug!("trimmed {}", fs.mountpoint),
            Err(e) => warn!("fstrim failed on {}: {}", fs.mountpoint, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CpuTopology, FirmwareHint, Hypervisor, Nic};

    fn inspect(os_type: &str, distro: &str) -> Inspect {
        Inspect {
            root: "/dev/sda2".into(),
            os_type: os_type.into(),
            distro: distro.into(),
            product_name: "test".into(),
            arch: "x86_64".into(),
            major_version: 1,
            minor_version: 0,
            package_format: "rpm".into(),
            package_management: "dnf".into(),
            firmware: crate::inspect::GuestFirmware::Bios,
            mountpoints: vec![],
        }
    }

    #[derive(Debug)]
    struct NeverMatches;

    impl ConversionModule for NeverMatches {
        fn name(&self) -> &'static str {
            "never"
        }
        fn matches(&self, _inspect: &Inspect) -> bool {
            false
        }
        fn convert(
            &self,
            _appliance: &mut dyn Appliance,
            _inspect: &Inspect,
            _disks: &[SourceDisk],
            _output: &dyn OutputAdapter,
            _requested: &RequestedCaps,
            _static_ips: &[String],
        ) -> Result<GrantedCaps> {
            unreachable!()
        }
    }

    #[derive(Debug)]
    struct MatchesLinux;

    impl ConversionModule for MatchesLinux {
        fn name(&self) -> &'static str {
            "linux"
        }
        fn matches(&self, inspect: &Inspect) -> bool {
            inspect.os_type == "linux"
        }
        fn convert(
            &self,
            _appliance: &mut dyn Appliance,
            _inspect: &Inspect,
            _disks: &[SourceDisk],
            _output: &dyn OutputAdapter,
            _requested: &RequestedCaps,
            _static_ips: &[String],
        ) -> Result<GrantedCaps> {
            Ok(GrantedCaps {
                block_bus: BlockBus::VirtioBlk,
                net_bus: NetBus::VirtioNet,
                video: Video::Qxl,
            })
        }
    }

    #[test]
    fn test_registry_first_match_wins() {
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(NeverMatches));
        registry.register(Box::new(MatchesLinux));
        let module = registry.select(&inspect("linux", "fedora")).unwrap();
        assert_eq!(module.name(), "linux");
    }

    #[test]
    fn test_registry_no_match_is_unsupported_guest() {
        let registry = ModuleRegistry::new();
        let err = registry.select(&inspect("hurd", "gnu")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedGuest(_)));
        assert!(err.to_string().contains("unable to convert this guest type"));
    }

    #[test]
    fn test_requested_caps_default_is_permissive() {
        let caps = RequestedCaps::default();
        assert!(caps.block_bus.is_none());
        assert!(caps.net_bus.is_none());
        assert!(caps.video.is_none());
    }

    #[test]
    fn test_requested_caps_from_source() {
        let source = Source {
            name: "vm1".into(),
            orig_name: None,
            hypervisor: Hypervisor::Kvm,
            memory: 1 << 30,
            vcpu: 2,
            topology: Some(CpuTopology {
                sockets: 1,
                cores: 2,
                threads: 1,
            }),
            cpu_vendor: None,
            cpu_model: None,
            nics: vec![Nic {
                mac: None,
                network: "default".into(),
                model: Some(NetBus::VirtioNet),
            }],
            removables: vec![],
            video: Some(Video::Qxl),
            firmware: FirmwareHint::Bios,
        };
        let disks = vec![SourceDisk {
            uri: "/d0".into(),
            format: None,
            id: 0,
            controller: ControllerKind::VirtioScsi,
        }];
        let caps = RequestedCaps::from_source(&source, &disks);
        assert_eq!(caps.block_bus, Some(BlockBus::VirtioScsi));
        assert_eq!(caps.net_bus, Some(NetBus::VirtioNet));
        assert_eq!(caps.video, Some(Video::Qxl));
    }

    #[test]
    fn test_sata_maps_to_ide_request() {
        let source = Source {
            name: "x".into(),
            orig_name: None,
            hypervisor: Hypervisor::Kvm,
            memory: 1,
            vcpu: 1,
            topology: None,
            cpu_vendor: None,
            cpu_model: None,
            nics: vec![],
            removables: vec![],
            video: None,
            firmware: FirmwareHint::Unknown,
        };
        let disks = vec![SourceDisk {
            uri: "/d0".into(),
            format: None,
            id: 0,
            controller: ControllerKind::Sata,
        }];
        let caps = RequestedCaps::from_source(&source, &disks);
        assert_eq!(caps.block_bus, Some(BlockBus::Ide));
    }
}
