// src/commands/convert.rs
//! The conversion command
//!
//! Builds the adapters and options from the parsed command line and
//! hands everything to the pipeline driver.

use crate::cli::{Cli, InputMode, OutputAlloc, OutputMode};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::process::ExitCode;
use tracing::debug;
use virtshift::appliance::{Appliance, GuestfishAppliance};
use virtshift::convert::builtin_registry;
use virtshift::input::{DiskInput, InputAdapter};
use virtshift::output::{LocalOutput, NullOutput, OutputAdapter};
use virtshift::pipeline::{self, ConvertOptions};
use virtshift::preflight;
use virtshift::progress::{CliProgress, ProgressTracker, SilentProgress};
use virtshift::source::NetworkMap;
use virtshift::target::Allocation;

/// Parse repeated `--key DEVICE:FILE` arguments into a device to
/// passphrase map
fn parse_keys(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut keys = BTreeMap::new();
    for entry in entries {
        let (device, file) = entry
            .split_once(':')
            .with_context(|| format!("invalid --key '{}', expected DEVICE:FILE", entry))?;
        let passphrase = fs::read_to_string(file)
            .with_context(|| format!("cannot read passphrase file {}", file))?;
        keys.insert(device.to_string(), passphrase.trim_end().to_string());
    }
    Ok(keys)
}

/// Run a conversion from the parsed command line
pub fn cmd_convert(cli: Cli) -> Result<ExitCode> {
    let input: Box<dyn InputAdapter> = match cli.input {
        InputMode::Disk => Box::new(DiskInput::new(cli.args.clone())),
    };

    if cli.in_place && cli.output_storage.is_some() {
        bail!("--in-place does not write to an output storage");
    }

    let tmpdir = preflight::large_tmpdir();
    // Print modes and in-place conversion never produce a target, so
    // they do not force the user to configure one.
    let no_target = cli.in_place || cli.print_source || cli.print_estimate;
    let output: Box<dyn OutputAdapter> = if no_target {
        Box::new(NullOutput::new(tmpdir.clone()))
    } else {
        match cli.output {
            OutputMode::Local => {
                let dir = cli
                    .output_storage
                    .clone()
                    .context("-o local requires --output-storage DIR")?;
                Box::new(LocalOutput::new(dir))
            }
            OutputMode::Null => Box::new(NullOutput::new(tmpdir.clone())),
        }
    };

    let opts = ConvertOptions {
        name: cli.name.clone(),
        network_map: NetworkMap::parse(&cli.network_map)?,
        in_place: cli.in_place,
        print_source: cli.print_source,
        print_estimate: cli.print_estimate,
        machine_readable: cli.machine_readable,
        compressed: cli.compressed,
        output_format: cli.output_format.clone(),
        allocation: cli.output_alloc.map(|a| match a {
            OutputAlloc::Sparse => Allocation::Sparse,
            OutputAlloc::Preallocated => Allocation::Preallocated,
        }),
        keys: parse_keys(&cli.key)?,
        static_ips: cli.static_ip.clone(),
        bandwidth: cli.bandwidth,
        debug_overlays: cli.debug_overlays,
        tmpdir: Some(tmpdir),
    };
    debug!("input: {}", input.as_options());
    debug!("output: {}", output.as_options());

    let registry = builtin_registry();
    let appliance_factory = || -> virtshift::Result<Box<dyn Appliance>> {
        Ok(Box::new(GuestfishAppliance::new()?))
    };
    let progress: Box<dyn ProgressTracker> = if cli.machine_readable {
        Box::new(SilentProgress::new())
    } else {
        Box::new(CliProgress::new("Converting", cli.args.len().max(1) as u64))
    };

    pipeline::run(
        input.as_ref(),
        output.as_ref(),
        &registry,
        &appliance_factory,
        &opts,
        progress.as_ref(),
    )?;
    Ok(ExitCode::SUCCESS)
}
