//! Error taxonomy for the experiment harness.
//!
//! Mirrors the failure classes of the sweep pipeline:
//! - transport failures talking to the serving endpoint (retryable once
//!   under the OOM signature, otherwise propagated),
//! - validation failures for explicit test-case files (carry the full
//!   per-case problem list so the CLI can print them and exit 2),
//! - analysis failures (degraded to report warnings by the analyzer).
//!
//! Telemetry reads never surface here: the sampler swallows them by
//! contract and degrades to zero values.

use thiserror::Error;

/// Errors produced by the harness.
#[derive(Debug, Error)]
pub enum MedirError {
    /// Endpoint unreachable, HTTP error status, or timeout.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The generation stream ended without a usable result.
    #[error("Generation error: {0}")]
    Generation(String),

    /// Malformed payload or file content.
    #[error("Format error: {reason}")]
    Format {
        /// Description of the malformed content
        reason: String,
    },

    /// Test-case validation failed; one entry per problem.
    #[error("Validation failed: {}", problems.join("; "))]
    Validation {
        /// Per-case problem strings, e.g. `case[2] missing temperature`
        problems: Vec<String>,
    },

    /// A statistical analysis step could not run.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Filesystem failure while persisting or reading run artifacts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MedirError {
    /// Process exit code for this error (validation failures exit 2,
    /// everything else exits 1).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } => 2,
            _ => 1,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, MedirError>;
