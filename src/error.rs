// src/error.rs
//! Error types for the conversion pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort the conversion pipeline
///
/// The pipeline uses a single fatal error channel: any subprocess
/// failure, invariant violation, or missing prerequisite ends the
/// run. Conditions that do not abort (unknown hypervisor, topology
/// mismatch, failed fstrim) are logged as warnings instead and never
/// appear here.
#[derive(Error, Debug)]
pub enum Error {
    /// Source metadata violates an invariant
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// An external tool exited with a non-zero status
    #[error("{tool} failed: {stderr}")]
    Subprocess { tool: String, stderr: String },

    /// A required external tool is missing from PATH
    #[error("required tool '{0}' was not found; install it and retry")]
    MissingTool(String),

    /// Not enough free space to proceed
    #[error("not enough free space in {path}: {needed} bytes needed, {available} available. \
             Set VIRTSHIFT_TMPDIR to relocate the temporary directory")]
    NoSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    /// Overlay construction or validation failed
    #[error("overlay error: {0}")]
    Overlay(String),

    /// The guest filesystem appliance reported an error
    #[error("appliance error: {0}")]
    Appliance(String),

    /// Guest inspection found no convertible operating system
    #[error("inspection error: {0}")]
    Inspection(String),

    /// No conversion module matched the inspected guest
    #[error("unable to convert this guest type ({0})")]
    UnsupportedGuest(String),

    /// The requested firmware is not supported by the output
    #[error("firmware error: {0}")]
    Firmware(String),

    /// Output format selection failed
    #[error("output format error: {0}")]
    Format(String),

    /// The output adapter rejected or failed an operation
    #[error("output error: {0}")]
    Output(String),

    /// Invariant violation inside the pipeline itself
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// System call error
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Generic pipeline error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new "other" error with a message
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a subprocess error from a tool name and captured stderr
    pub fn subprocess(tool: impl Into<String>, stderr: impl AsRef<[u8]>) -> Self {
        Self::Subprocess {
            tool: tool.into(),
            stderr: String::from_utf8_lossy(stderr.as_ref()).trim().to_string(),
        }
    }
}
