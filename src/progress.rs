// src/progress.rs

//! Progress reporting for the copy phase
//!
//! The copy engine reports per-disk progress through a small trait
//! so the CLI can show a bar while machine-readable or scripted runs
//! stay quiet.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Core trait for progress tracking
pub trait ProgressTracker {
    /// Set the current status message
    fn set_message(&self, message: &str);

    /// Increment progress by the given amount
    fn increment(&self, amount: u64);

    /// Finish progress with a final message
    fn finish_with_message(&self, message: &str);
}

/// Silent progress tracker (no-op)
#[derive(Debug, Default)]
pub struct SilentProgress;

impl SilentProgress {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}
    fn increment(&self, _amount: u64) {}
    fn finish_with_message(&self, _message: &str) {}
}

/// Logs progress through tracing, for non-interactive runs
#[derive(Debug, Default)]
pub struct LogProgress {
    position: AtomicU64,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}", message);
    }

    fn increment(&self, amount: u64) {
        self.position.fetch_add(amount, Ordering::Relaxed);
    }

    fn finish_with_message(&self, message: &str) {
        info!("{}", message);
    }
}

/// Visual progress bar using indicatif
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new(message: &str, length: u64) -> Self {
        let bar = ProgressBar::new(length);
        bar.set_style(
            ProgressStyle::with_template("{msg:30} [{bar:40}] {pos}/{len}")
                .expect("static template")
                .progress_chars("=> "),
        );
        bar.set_message(message.to_string());
        Self { bar }
    }
}

impl ProgressTracker for CliProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}
