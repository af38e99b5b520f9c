//! Errors reported by the OCR orchestrator.
//!
//! Collaborators (engines, preprocessors, input providers) report plain
//! [`anyhow::Error`] values. The orchestrator sorts those into an [`OcrError`],
//! so that callers can tell which stage of the request failed.

use std::{fmt, time::Duration};

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// A terminal failure of an OCR request.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The request was invalid. Nothing was acquired.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The preprocessing collaborator failed. No workers were acquired.
    #[error("image preprocessing failed: {source}")]
    Preprocessing {
        #[source]
        source: anyhow::Error,
    },

    /// An OCR worker could not be started. Any workers which had already
    /// started have been released.
    #[error("could not start OCR worker for {language:?}: {source}")]
    Initialization {
        language: String,
        #[source]
        source: anyhow::Error,
    },

    /// Recognition failed on every attempt. Carries the final attempt's error.
    #[error("{source}")]
    Recognition {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The caller-supplied time limit ran out.
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
}

impl OcrError {
    /// A short, stable name for the kind of failure.
    pub fn kind(&self) -> &'static str {
        match self {
            OcrError::Configuration(_) => "configuration",
            OcrError::Preprocessing { .. } => "preprocessing",
            OcrError::Initialization { .. } => "initialization",
            OcrError::Recognition { .. } => "recognition",
            OcrError::Timeout(_) => "timeout",
        }
    }

    /// The full chain of error messages, for diagnostics.
    pub fn trace(&self) -> String {
        let mut trace = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            let msg = err.to_string();
            // `Recognition` displays its source directly, so skip the echo.
            if !trace.ends_with(&msg) {
                trace.push_str("\n\nCaused by:\n    ");
                trace.push_str(&msg);
            }
            source = err.source();
        }
        trace
    }
}

/// A worker which could not be terminated cleanly.
///
/// These never replace the primary result of a request. They're reported
/// alongside it.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct CleanupError {
    /// The language of the worker.
    pub language: String,

    /// What went wrong.
    pub message: String,
}

impl CleanupError {
    /// Record a failure to terminate the worker for `language`.
    pub fn new(language: &str, err: &anyhow::Error) -> Self {
        Self {
            language: language.to_owned(),
            message: format!("{:#}", err),
        }
    }
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to terminate {} worker: {}", self.language, self.message)
    }
}
