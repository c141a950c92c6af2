// src/target.rs

//! Target layout planning
//!
//! Once the conversion module has granted its capabilities, the
//! pipeline decides what the converted machine looks like on the
//! target: which bus each disk and removable device sits on, which
//! firmware boots the guest, and which on-disk format each copied
//! disk uses.

use crate::convert::{BlockBus, GrantedCaps};
use crate::error::{Error, Result};
use crate::inspect::{GuestFirmware, Inspect};
use crate::output::OutputAdapter;
use crate::overlay::{device_name, Overlay};
use crate::source::{FirmwareHint, Removable, RemovableKind, Source, SourceDisk};
use std::path::PathBuf;
use tracing::info;

/// Formats the copy engine knows how to produce
const SUPPORTED_FORMATS: &[&str] = &["raw", "qcow2"];

/// Firmware the converted guest boots with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFirmware {
    Bios,
    Uefi,
}

impl TargetFirmware {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Uefi => "uefi",
        }
    }
}

/// One slot on the target block bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSlot {
    /// A converted disk, by source disk id
    Disk { disk_id: usize, device: String },
    /// An empty removable drive carried over from the source
    Removable { kind: RemovableKind, device: String },
}

/// Assignment of disks and removables to the target block bus
#[derive(Debug, Clone)]
pub struct TargetBusAssignment {
    pub bus: BlockBus,
    pub slots: Vec<BusSlot>,
}

/// Map source disks and removable devices onto the granted bus.
///
/// Disks come first, in source order, then removables; device names
/// restart from index 0 with the prefix of the granted bus, so a
/// virtio-blk guest sees `vda`, `vdb`, ...
pub fn assign_buses(
    disks: &[SourceDisk],
    removables: &[Removable],
    caps: &GrantedCaps,
) -> TargetBusAssignment {
    let prefix = caps.block_bus.device_prefix();
    let mut slots = Vec::with_capacity(disks.len() + removables.len());
    for (i, disk) in disks.iter().enumerate() {
        let device = format!("{}{}", prefix, &device_name(i)[2..]);
        slots.push(BusSlot::Disk {
            disk_id: disk.id,
            device,
        });
    }
    for (j, rem) in removables.iter().enumerate() {
        let device = format!("{}{}", prefix, &device_name(disks.len() + j)[2..]);
        slots.push(BusSlot::Removable {
            kind: rem.kind,
            device,
        });
    }
    TargetBusAssignment {
        bus: caps.block_bus,
        slots,
    }
}

/// Decide the target firmware and check the output supports it.
///
/// The source's hint wins when it is definite; otherwise the
/// inspector's determination is used.
pub fn target_firmware(
    source: &Source,
    inspect: &Inspect,
    output: &dyn OutputAdapter,
    caps: &GrantedCaps,
) -> Result<TargetFirmware> {
    let firmware = match source.firmware {
        FirmwareHint::Bios => TargetFirmware::Bios,
        FirmwareHint::Uefi => TargetFirmware::Uefi,
        FirmwareHint::Unknown => match &inspect.firmware {
            GuestFirmware::Bios => TargetFirmware::Bios,
            GuestFirmware::Uefi { .. } => TargetFirmware::Uefi,
        },
    };

    if !output.supported_firmware().contains(&firmware) {
        return Err(Error::Firmware(format!(
            "this guest requires {} firmware which the selected output does not support",
            firmware.as_str()
        )));
    }
    output.check_target_firmware(caps, firmware)?;

    if firmware == TargetFirmware::Uefi {
        info!("this guest will boot with UEFI firmware on the target");
    }
    Ok(firmware)
}

/// Pick the on-disk output format for one overlay.
///
/// The first rule that yields a format wins: the output adapter's
/// override, then the `--output-format` flag, then the format the
/// source declared for the disk.
pub fn resolve_format(
    output: &dyn OutputAdapter,
    cli_format: Option<&str>,
    compressed: bool,
    overlay: &Overlay,
) -> Result<String> {
    let format = output
        .override_output_format(overlay)
        .or_else(|| cli_format.map(str::to_string))
        .or_else(|| overlay.source.format.clone())
        .ok_or_else(|| {
            Error::Format(format!(
                "disk {} has no defined format; use --output-format",
                overlay.source.id
            ))
        })?;

    if !SUPPORTED_FORMATS.contains(&format.as_str()) {
        return Err(Error::Format(format!(
            "unsupported output format '{}' for disk {}; expected raw or qcow2",
            format, overlay.source.id
        )));
    }
    if compressed && format != "qcow2" {
        return Err(Error::Format(
            "compression was requested but the output format is not qcow2".into(),
        ));
    }
    Ok(format)
}

/// Destination of one copied disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetFile {
    /// A local path the copier writes to directly
    File(PathBuf),
    /// An opaque URI handled by the image-conversion tool
    Uri(String),
}

impl TargetFile {
    /// Destination string passed to the image-conversion tool
    pub fn location(&self) -> Result<String> {
        match self {
            Self::File(path) => path
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| Error::other(format!("non-UTF8 path: {}", path.display()))),
            Self::Uri(uri) => Ok(uri.clone()),
        }
    }
}

/// One planned copy: where the disk goes and in which format
#[derive(Debug)]
pub struct TargetDisk {
    pub file: TargetFile,
    pub format: String,
    pub overlay: Overlay,
}

/// Allocation policy for created target disks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Sparse,
    Preallocated,
}

impl Allocation {
    /// Value of the `preallocation` parameter of disk creation
    pub fn preallocation(&self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Preallocated => "full",
        }
    }
}
