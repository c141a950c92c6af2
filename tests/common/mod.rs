// tests/common/mod.rs

//! Shared mocks for integration tests
//!
//! The appliance and the conversion module are external subsystems;
//! integration tests drive the pipeline with scripted stand-ins so
//! a test run needs no libguestfs and no real guest image.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use virtshift::appliance::{Appliance, DriveOptions};
use virtshift::convert::{BlockBus, ConversionModule, GrantedCaps, RequestedCaps};
use virtshift::inspect::{FsStats, GuestFirmware, Inspect, MountedFs};
use virtshift::output::OutputAdapter;
use virtshift::overlay::Overlay;
use virtshift::source::{NetBus, Source, SourceDisk, Video};
use virtshift::target::{TargetBusAssignment, TargetDisk, TargetFile, TargetFirmware};
use virtshift::Result;

/// What the mock appliance saw, shared with the test body
#[derive(Debug, Default)]
pub struct ApplianceLog {
    pub drives: Vec<(String, Option<String>)>,
    pub launched: bool,
    pub unlocked: Vec<String>,
    pub trimmed: Vec<String>,
    pub shutdown: bool,
}

/// Scripted appliance: reports a fixed guest and records every call
pub struct MockAppliance {
    pub log: Rc<RefCell<ApplianceLog>>,
    pub inspect: Inspect,
    pub filesystems: Vec<(MountedFs, FsStats)>,
}

pub fn linux_inspect() -> Inspect {
    Inspect {
        root: "/dev/sda2".into(),
        os_type: "linux".into(),
        distro: "fedora".into(),
        product_name: "Fedora Linux 39".into(),
        arch: "x86_64".into(),
        major_version: 39,
        minor_version: 0,
        package_format: "rpm".into(),
        package_management: "dnf".into(),
        firmware: GuestFirmware::Bios,
        mountpoints: vec![("/".into(), "/dev/sda2".into())],
    }
}

/// A healthy ext4 root: 2 GiB filesystem, half free
pub fn ext4_root() -> (MountedFs, FsStats) {
    (
        MountedFs {
            device: "/dev/sda2".into(),
            mountpoint: "/".into(),
            fs_type: "ext4".into(),
        },
        FsStats {
            bsize: 4096,
            blocks: 524288,
            bfree: 262144,
            bavail: 262144,
            files: 131072,
            ffree: 100000,
        },
    )
}

impl MockAppliance {
    pub fn new(log: Rc<RefCell<ApplianceLog>>) -> Self {
        Self {
            log,
            inspect: linux_inspect(),
            filesystems: vec![ext4_root()],
        }
    }
}

impl Appliance for MockAppliance {
    fn add_drive(&mut self, location: &str, opts: &DriveOptions) -> Result<()> {
        self.log
            .borrow_mut()
            .drives
            .push((location.to_string(), opts.format.clone()));
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        self.log.borrow_mut().launched = true;
        Ok(())
    }

    fn unlock_device(&mut self, device: &str, _passphrase: &str) -> Result<()> {
        self.log.borrow_mut().unlocked.push(device.to_string());
        Ok(())
    }

    fn inspect(&mut self) -> Result<Inspect> {
        Ok(self.inspect.clone())
    }

    fn mounted_filesystems(&mut self) -> Result<Vec<MountedFs>> {
        Ok(self.filesystems.iter().map(|(fs, _)| fs.clone()).collect())
    }

    fn statvfs(&mut self, mountpoint: &str) -> Result<FsStats> {
        self.filesystems
            .iter()
            .find(|(fs, _)| fs.mountpoint == mountpoint)
            .map(|(_, stats)| *stats)
            .ok_or_else(|| virtshift::Error::Appliance(format!("not mounted: {}", mountpoint)))
    }

    fn remount_with_discard(&mut self, _fs: &MountedFs) -> Result<()> {
        Ok(())
    }

    fn fstrim(&mut self, mountpoint: &str) -> Result<()> {
        self.log.borrow_mut().trimmed.push(mountpoint.to_string());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.log.borrow_mut().shutdown = true;
        Ok(())
    }
}

/// Input adapter serving a pre-built source model
pub struct MemoryInput {
    pub source: Source,
    pub disks: Vec<SourceDisk>,
}

impl virtshift::input::InputAdapter for MemoryInput {
    fn precheck(&self) -> Result<()> {
        Ok(())
    }

    fn as_options(&self) -> String {
        "-i memory".to_string()
    }

    fn source(&self, _bandwidth: Option<u64>) -> Result<(Source, Vec<SourceDisk>)> {
        Ok((self.source.clone(), self.disks.clone()))
    }
}

/// Conversion module that matches any linux guest and grants virtio
#[derive(Debug)]
pub struct MockLinuxModule {
    pub granted: GrantedCaps,
}

impl MockLinuxModule {
    pub fn virtio() -> Self {
        Self {
            granted: GrantedCaps {
                block_bus: BlockBus::VirtioBlk,
                net_bus: NetBus::VirtioNet,
                video: Video::Qxl,
            },
        }
    }
}

impl ConversionModule for MockLinuxModule {
    fn name(&self) -> &'static str {
        "mock-linux"
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
        Ok(self.granted)
    }
}

/// Output adapter writing into a directory and recording callbacks
pub struct DirOutput {
    pub dir: PathBuf,
    pub copied: RefCell<Vec<usize>>,
    pub metadata_written: RefCell<bool>,
    pub fail_metadata: bool,
}

impl DirOutput {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            copied: RefCell::new(Vec::new()),
            metadata_written: RefCell::new(false),
            fail_metadata: false,
        }
    }

    pub fn failing_metadata(dir: &Path) -> Self {
        let mut out = Self::new(dir);
        out.fail_metadata = true;
        out
    }
}

impl OutputAdapter for DirOutput {
    fn precheck(&self) -> Result<()> {
        Ok(())
    }

    fn as_options(&self) -> String {
        format!("-o dir {}", self.dir.display())
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
        _format: &str,
        size: u64,
        _preallocation: Option<&str>,
        _compat: Option<&str>,
    ) -> Result<()> {
        // Raw targets must be at least the virtual size before a
        // no-create copy lands in them.
        std::fs::write(path, vec![0u8; size as usize])?;
        Ok(())
    }

    fn disk_copied(&self, _target: &TargetDisk, index: usize, _total: usize) -> Result<()> {
        self.copied.borrow_mut().push(index);
        Ok(())
    }

    fn create_metadata(
        &self,
        source: &Source,
        _targets: &[TargetDisk],
        _buses: &TargetBusAssignment,
        _caps: &GrantedCaps,
        _inspect: &Inspect,
        _firmware: TargetFirmware,
    ) -> Result<()> {
        if self.fail_metadata {
            return Err(virtshift::Error::Output("metadata emission failed".into()));
        }
        std::fs::write(self.dir.join(format!("{}.meta", source.name)), b"ok")?;
        *self.metadata_written.borrow_mut() = true;
        Ok(())
    }
}
