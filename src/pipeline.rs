// src/pipeline.rs

//! The conversion pipeline driver
//!
//! Composes an input adapter, a guest-conversion module and an
//! output adapter into the full copy-and-convert workflow:
//!
//! ```text
//! open source -> overlays -> appliance -> inspect -> estimate
//!   -> convert -> target plan -> copy -> metadata
//! ```
//!
//! The driver is single-threaded and strictly sequential; the only
//! parallelism lives inside the subprocesses it spawns. Two branch
//! points shape a run: in-place conversion skips everything on the
//! copy side, and estimate-only runs stop right after the overlays
//! exist.
//!
//! Invariants the driver owns: the source is never mutated (all
//! writes land in overlays), partial targets are removed on failure,
//! and space is checked before any long-running work starts.

use crate::appliance::{Appliance, DriveOptions};
use crate::convert::{self, ModuleRegistry, RequestedCaps};
use crate::copy;
use crate::error::{Error, Result};
use crate::estimate;
use crate::guard::CleanupGuard;
use crate::input::InputAdapter;
use crate::inspect;
use crate::output::OutputAdapter;
use crate::overlay::{self, Overlay};
use crate::preflight;
use crate::progress::ProgressTracker;
use crate::source::{self, NetworkMap};
use crate::target::{self, Allocation, TargetDisk};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Closure that builds the appliance when the pipeline needs it
pub type ApplianceFactory<'a> = &'a dyn Fn() -> Result<Box<dyn Appliance>>;

/// Everything the command line decided about this run
#[derive(Default)]
pub struct ConvertOptions {
    /// Rename the guest on the target
    pub name: Option<String>,
    pub network_map: NetworkMap,
    pub in_place: bool,
    pub print_source: bool,
    pub print_estimate: bool,
    pub machine_readable: bool,
    pub compressed: bool,
    /// `--output-format` flag
    pub output_format: Option<String>,
    pub allocation: Option<Allocation>,
    /// Device to passphrase map for encrypted guests
    pub keys: BTreeMap<String, String>,
    pub static_ips: Vec<String>,
    /// Read bandwidth limit in bytes per second
    pub bandwidth: Option<u64>,
    /// Keep overlays on exit and skip the trim pass
    pub debug_overlays: bool,
    /// Override the large temporary directory (mainly for tests)
    pub tmpdir: Option<PathBuf>,
}

/// How this run treats the source disks
enum ConversionMode {
    /// Copy through overlays; the source is never written
    Copying(Vec<Overlay>),
    /// Mutate the source disks directly; nothing is copied
    InPlace,
}

/// What a finished run produced
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Full conversion completed
    Converted,
    /// `--print-source` rendering was written to stdout
    PrintedSource,
    /// `--print-estimate` report was written to stdout
    PrintedEstimate,
}

/// Run the whole pipeline.
///
/// On error every partial target file is already gone by the time
/// this returns; overlays are removed on every path unless the user
/// asked to keep them.
pub fn run(
    input: &dyn InputAdapter,
    output: &dyn OutputAdapter,
    registry: &ModuleRegistry,
    appliance_factory: ApplianceFactory<'_>,
    opts: &ConvertOptions,
    progress: &dyn ProgressTracker,
) -> Result<Outcome> {
    // Fail early on option combinations no stage could satisfy,
    // before a single subprocess runs.
    if opts.compressed && opts.output_format.as_deref() == Some("raw") {
        return Err(Error::Format(
            "compression was requested but the output format is not qcow2".into(),
        ));
    }
    if opts.in_place && opts.print_estimate {
        return Err(Error::other(
            "--print-estimate makes no sense with --in-place",
        ));
    }

    input.precheck()?;
    output.precheck()?;

    let (source, disks) = source::open_source(
        input,
        opts.bandwidth,
        opts.name.as_deref(),
        &opts.network_map,
    )?;

    if opts.print_source {
        print!("{}", source::render_source(&source, &disks));
        return Ok(Outcome::PrintedSource);
    }

    let tmpdir = opts
        .tmpdir
        .clone()
        .unwrap_or_else(preflight::large_tmpdir);

    // Overlay files must not outlive the run; their guard is armed
    // for the whole pipeline and never disarmed.
    let mut overlay_guard = CleanupGuard::new();

    let mode = if opts.in_place {
        info!("converting '{}' in place", source.name);
        ConversionMode::InPlace
    } else {
        preflight::check_tools()?;
        preflight::check_host_free_space(&tmpdir)?;
        let overlays = overlay::create_overlays(&tmpdir, &disks)?;
        if opts.debug_overlays {
            overlay::report_preserved(&overlays);
        } else {
            for ov in &overlays {
                overlay_guard.register(ov.path.clone());
            }
        }
        ConversionMode::Copying(overlays)
    };

    if opts.print_estimate {
        let overlays = match &mode {
            ConversionMode::Copying(overlays) => overlays,
            ConversionMode::InPlace => unreachable!("rejected above"),
        };
        let report = estimate::print_estimate(overlays, opts.machine_readable)?;
        print!("{}", report);
        return Ok(Outcome::PrintedEstimate);
    }

    // Launch the appliance with either the overlays or, in place,
    // the source disks themselves.
    let mut appliance = appliance_factory()?;
    match &mode {
        ConversionMode::Copying(overlays) => {
            for ov in overlays {
                let path = ov.path.to_str().ok_or_else(|| {
                    Error::other(format!("non-UTF8 path: {}", ov.path.display()))
                })?;
                appliance.add_drive(path, &DriveOptions::overlay())?;
            }
        }
        ConversionMode::InPlace => {
            for disk in &disks {
                appliance.add_drive(&disk.uri, &DriveOptions::in_place(disk.format.as_deref()))?;
            }
        }
    }
    progress.set_message("Launching the appliance");
    appliance.launch()?;

    let inspection = inspect::inspect_guest(appliance.as_mut(), &opts.keys)?;
    let mounts = inspect::collect_mount_stats(appliance.as_mut())?;
    inspect::check_guest_free_space(&mounts, inspection.is_windows())?;

    if let ConversionMode::Copying(overlays) = &mode {
        estimate::estimate_target_sizes(&mounts, overlays);
    }

    let requested = if opts.in_place {
        RequestedCaps::from_source(&source, &disks)
    } else {
        RequestedCaps::default()
    };
    progress.set_message("Converting the guest");
    let granted = convert::run_conversion(
        registry,
        appliance.as_mut(),
        &inspection,
        &disks,
        output,
        &requested,
        &opts.static_ips,
    )?;

    let do_trim = matches!(mode, ConversionMode::Copying(_)) && !opts.debug_overlays;
    if do_trim {
        progress.set_message("Trimming filesystems");
        convert::trim_filesystems(appliance.as_mut())?;
    }

    // All guest-side work is done; shut the appliance down before
    // touching the target so its caches are flushed into the
    // overlays.
    appliance.shutdown()?;
    drop(appliance);

    let overlays = match mode {
        ConversionMode::InPlace => {
            info!("in-place conversion of '{}' finished", source.name);
            return Ok(Outcome::Converted);
        }
        ConversionMode::Copying(overlays) => overlays,
    };

    let firmware = target::target_firmware(&source, &inspection, output, &granted)?;
    let buses = target::assign_buses(&disks, &source.removables, &granted);
    debug!(
        "target layout: {} firmware, {} slots on the {} bus",
        firmware.as_str(),
        buses.slots.len(),
        buses.bus.as_str()
    );

    let formats: Vec<String> = overlays
        .iter()
        .map(|ov| target::resolve_format(output, opts.output_format.as_deref(), opts.compressed, ov))
        .collect::<Result<_>>()?;

    let files = {
        let planned: Vec<(String, &Overlay)> =
            formats.iter().cloned().zip(overlays.iter()).collect();
        output.prepare_targets(&source.name, &planned, &granted)?
    };
    if files.len() != overlays.len() {
        return Err(Error::Internal(format!(
            "output prepared {} targets for {} disks",
            files.len(),
            overlays.len()
        )));
    }

    let targets: Vec<TargetDisk> = files
        .into_iter()
        .zip(formats)
        .zip(overlays)
        .map(|((file, format), overlay)| TargetDisk {
            file,
            format,
            overlay,
        })
        .collect();

    // Partial targets vanish on failure; disarmed only after the
    // metadata is out.
    let mut target_guard = CleanupGuard::new();
    copy::copy_disks(
        &targets,
        output,
        &mut target_guard,
        opts.compressed,
        opts.allocation,
        progress,
    )?;

    progress.set_message("Creating output metadata");
    output.create_metadata(&source, &targets, &buses, &granted, &inspection, firmware)?;
    target_guard.disarm();

    info!("conversion of '{}' finished", source.name);
    Ok(Outcome::Converted)
}
