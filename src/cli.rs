// src/cli.rs
//! CLI definitions for virtshift
//!
//! This module contains the command-line interface definitions using
//! clap. The actual conversion logic is in the `commands` module.

use clap::{Parser, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "virtshift")]
#[command(version)]
#[command(about = "Convert virtual machine images from foreign hypervisors to run on KVM", long_about = None)]
pub struct Cli {
    /// Input mode
    #[arg(short = 'i', long, value_enum, default_value = "disk")]
    pub input: InputMode,

    /// Output mode
    #[arg(short = 'o', long, value_enum, default_value = "local")]
    pub output: OutputMode,

    /// Output storage directory (local output mode)
    #[arg(long, value_name = "DIR")]
    pub output_storage: Option<PathBuf>,

    /// Output disk format (raw or qcow2); overrides the source's
    /// declared format
    #[arg(long, value_name = "FORMAT")]
    pub output_format: Option<String>,

    /// Output allocation mode
    #[arg(long, value_enum, value_name = "MODE")]
    pub output_alloc: Option<OutputAlloc>,

    /// Rename the guest on the target
    #[arg(short = 'n', long, value_name = "NAME")]
    pub name: Option<String>,

    /// Map a source network name to a target network name (IN:OUT);
    /// an entry without a colon sets the default
    #[arg(long, value_name = "IN:OUT")]
    pub network_map: Vec<String>,

    /// Passphrase file for an encrypted device (DEVICE:FILE)
    #[arg(long, value_name = "DEVICE:FILE")]
    pub key: Vec<String>,

    /// Static IP to configure in the guest (handed to the conversion
    /// module verbatim)
    #[arg(long, value_name = "SPEC")]
    pub static_ip: Vec<String>,

    /// Read bandwidth limit in bytes per second
    #[arg(long, value_name = "BYTES")]
    pub bandwidth: Option<u64>,

    /// Convert the source guest in place instead of copying it
    #[arg(long)]
    pub in_place: bool,

    /// Compress the copied disks (qcow2 only)
    #[arg(long)]
    pub compressed: bool,

    /// Print the source description and exit
    #[arg(long)]
    pub print_source: bool,

    /// Estimate the target disk space and exit
    #[arg(long)]
    pub print_estimate: bool,

    /// Produce machine-readable output and no progress bars
    #[arg(long)]
    pub machine_readable: bool,

    /// Keep the overlays on exit for debugging and skip trimming
    #[arg(long)]
    pub debug_overlays: bool,

    /// Generate shell completions and exit
    #[arg(long, value_enum, value_name = "SHELL", hide = true)]
    pub completions: Option<Shell>,

    /// Input arguments (disk image paths in disk input mode)
    #[arg(value_name = "ARG")]
    pub args: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputMode {
    /// Local disk images
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Local directory plus libvirt XML
    Local,
    /// Discard everything (test a conversion)
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputAlloc {
    Sparse,
    Preallocated,
}
