//! Human-readable progress reporting.
//!
//! The orchestrator never logs progress lines to a global sink. Instead, a
//! [`LogSink`] is passed in with each request's configuration. We still emit
//! `tracing` events for debugging, but those are separate.

#[cfg(test)]
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;

use crate::prelude::*;

/// Destination for human-readable progress lines.
pub trait LogSink: Send + Sync + 'static {
    /// Log a single line.
    fn log(&self, line: &str);

    /// A worker for `language` is ready. `ready` counts from 1.
    fn worker_ready(&self, language: &str, ready: usize, total: usize) {
        self.log(&format!(
            "OCR worker ready for {language} ({ready}/{total})"
        ));
    }
}

/// A [`LogSink`] which forwards everything to `tracing` at `info` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, line: &str) {
        info!("{}", line);
    }
}

/// A [`LogSink`] which drives a progress bar, one tick per worker, and
/// forwards lines to `tracing`.
pub struct ProgressLogSink {
    pb: ProgressBar,
}

impl ProgressLogSink {
    /// Wrap a progress bar. The bar's length should be the number of languages.
    pub fn new(pb: ProgressBar) -> Self {
        Self { pb }
    }
}

impl LogSink for ProgressLogSink {
    fn log(&self, line: &str) {
        info!("{}", line);
    }

    fn worker_ready(&self, language: &str, ready: usize, total: usize) {
        self.pb.set_message(format!("Started {language} worker"));
        self.pb.set_position(ready as u64);
        if ready == total {
            self.pb.finish();
        }
        self.log(&format!(
            "OCR worker ready for {language} ({ready}/{total})"
        ));
    }
}

/// A [`LogSink`] which remembers every line.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingLogSink {
    lines: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl RecordingLogSink {
    /// Get a copy of all lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl LogSink for RecordingLogSink {
    fn log(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_owned());
        }
    }
}
