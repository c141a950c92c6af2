// src/qemuimg.rs

//! Wrapper around the `qemu-img` command-line tool
//!
//! Every disk the pipeline touches goes through qemu-img: overlay
//! creation (`create -b`), probing (`info --output=json`), size
//! estimation (`measure`) and the final streaming copy (`convert`).
//! All subcommands that can produce structured output are run with
//! `--output=json` and deserialized with serde.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Information returned by `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    /// Virtual size of the disk image in bytes
    pub virtual_size: u64,
    /// Image format (e.g. "qcow2", "raw")
    pub format: Option<String>,
    /// Actual size on disk in bytes (if available)
    pub actual_size: Option<u64>,
    /// Cluster size in bytes (for formats like qcow2)
    pub cluster_size: Option<u64>,
    /// Backing file name as recorded in the image header
    pub backing_filename: Option<String>,
    /// Resolved path to the backing file
    pub full_backing_filename: Option<String>,
}

impl ImageInfo {
    /// Whether the image has a backing file at all
    pub fn has_backing_file(&self) -> bool {
        self.backing_filename.is_some() || self.full_backing_filename.is_some()
    }
}

/// Output of `qemu-img measure --output=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Measurement {
    /// Bytes required on the target in the worst case
    pub required: u64,
    /// Bytes required if the target is fully allocated
    pub fully_allocated: u64,
}

/// Check if `qemu-img` is available on the system
pub fn available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn run(args: &[&str]) -> Result<Vec<u8>> {
    debug!("running qemu-img {}", args.join(" "));
    let output = Command::new("qemu-img")
        .args(args)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::MissingTool("qemu-img".to_string()),
            _ => Error::Io(e),
        })?;
    if !output.status.success() {
        return Err(Error::subprocess("qemu-img", &output.stderr));
    }
    Ok(output.stdout)
}

/// Run `qemu-img info --force-share --output=json` on an image or URI.
///
/// `--force-share` lets us probe images that another process holds a
/// write lock on, which happens when probing a live source.
pub fn info(location: &str) -> Result<ImageInfo> {
    let stdout = run(&["info", "--force-share", "--output=json", "--", location])?;
    Ok(serde_json::from_slice(&stdout)?)
}

/// Create a qcow2 v3 overlay backed by `backing_uri`.
///
/// The overlay records the backing format when the source declared
/// one; otherwise qemu probes the backing file on open.
pub fn create_overlay(path: &Path, backing_uri: &str, backing_format: Option<&str>) -> Result<()> {
    let path = path_str(path)?;
    let mut args = vec!["create", "-q", "-f", "qcow2", "-o", "compat=1.1", "-b", backing_uri];
    if let Some(fmt) = backing_format {
        args.push("-F");
        args.push(fmt);
    }
    args.push("--");
    args.push(path);
    run(&args)?;
    Ok(())
}

/// Create a blank image, used by output adapters to pre-create
/// destination disks.
pub fn create_blank(
    path: &Path,
    format: &str,
    size: u64,
    preallocation: Option<&str>,
    compat: Option<&str>,
) -> Result<()> {
    let path = path_str(path)?;
    let size = size.to_string();
    let mut args = vec!["create", "-q", "-f", format];
    let mut opts = Vec::new();
    if let Some(prealloc) = preallocation {
        opts.push(format!("preallocation={}", prealloc));
    }
    if let Some(compat) = compat {
        opts.push(format!("compat={}", compat));
    }
    let opts = opts.join(",");
    if !opts.is_empty() {
        args.push("-o");
        args.push(&opts);
    }
    args.push("--");
    args.push(path);
    args.push(&size);
    run(&args)?;
    Ok(())
}

/// Copy an overlay to its destination.
///
/// The destination must already exist (`-n`); sparse detection uses
/// 64k chunks so zeroed and trimmed ranges are skipped.
pub fn convert(
    overlay: &Path,
    destination: &str,
    transfer_format: &str,
    compressed: bool,
) -> Result<()> {
    let overlay = path_str(overlay)?;
    let mut args = vec!["convert", "-n", "-f", "qcow2", "-O", transfer_format];
    if compressed {
        args.push("-c");
    }
    args.push("-S");
    args.push("64k");
    args.push("--");
    args.push(overlay);
    args.push(destination);
    run(&args)?;
    Ok(())
}

/// Run `qemu-img measure` on an overlay, reporting the worst-case
/// qcow2 target size.
pub fn measure(overlay: &Path) -> Result<Measurement> {
    let overlay = path_str(overlay)?;
    let stdout = run(&[
        "measure",
        "-f",
        "qcow2",
        "-O",
        "qcow2",
        "--output=json",
        "--",
        overlay,
    ])?;
    Ok(serde_json::from_slice(&stdout)?)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::other(format!("non-UTF8 path: {}", path.display())))
}
