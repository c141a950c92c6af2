// src/input/mod.rs

//! Input adapters
//!
//! An input adapter knows how to read one kind of source (local disk
//! images, a libvirt domain, an OVA, ...) and produce the source
//! model. Each disk URI it returns must be openable by qemu-img.

mod disk;

pub use disk::DiskInput;

use crate::error::Result;
use crate::source::{Source, SourceDisk};

/// Contract between the pipeline and an input adapter
pub trait InputAdapter {
    /// Validate prerequisites (tools, credentials) before opening
    fn precheck(&self) -> Result<()>;

    /// Human description for messages
    fn as_options(&self) -> String;

    /// Produce the source model; `bandwidth` is an optional read
    /// bandwidth limit in bytes per second
    fn source(&self, bandwidth: Option<u64>) -> Result<(Source, Vec<SourceDisk>)>;
}
