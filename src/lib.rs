//! # Medir
//!
//! Benchmark harness for locally-hosted LLMs served over an
//! Ollama-compatible HTTP API.
//!
//! Medir (Spanish: "to measure") drives repeated generation runs
//! across a (model x task x load) grid, samples host and GPU telemetry
//! in the background of every run, scores output quality per task, and
//! persists everything as flat files: one JSON record per run plus CSV
//! summaries. A separate offline analyzer derives composite
//! efficiency metrics and multivariate statistics from a finished
//! experiment directory.
//!
//! ## Features
//!
//! - **Sweep driver**: default cross-product grid or explicit
//!   validated test-case files, with dry-run planning
//! - **Telemetry**: CPU/memory/disk via `sysinfo`, GPU via NVML, with
//!   energy integration over the sampling trace
//! - **Streaming client**: first-token latency, engine counters, and a
//!   single reduced-shape retry under memory pressure
//! - **Quality scoring**: task-conditional (semantic, structural code
//!   checks, lexical diversity)
//! - **Offline analysis**: per-task normalization, efficiency and
//!   quality-to-cost composites, correlation/PCA/MANOVA/clustering/CCA
//!
//! ## Example
//!
//! ```rust
//! use medir::record::{LoadTier, TaskKind};
//!
//! // Load tiers cap the token budget of a run.
//! assert_eq!(LoadTier::Short.token_budget(512), 128);
//! assert_eq!(TaskKind::parse("knowledge_qa"), Some(TaskKind::Qa));
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)] // u64 -> i64 for timestamps is safe
#![allow(clippy::cast_precision_loss)] // usize -> f64 for statistics
#![allow(clippy::cast_possible_truncation)] // metric conversions are bounded
#![allow(clippy::cast_sign_loss)] // metric conversions are non-negative
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::missing_errors_doc)] // Error conditions follow from MedirError
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args

/// Offline composite analysis of finished experiments
pub mod analyze;
/// Streaming HTTP client for the serving endpoint
pub mod client;
/// Error taxonomy
pub mod error;
/// Multivariate statistics (correlation, PCA, MANOVA, clustering, CCA)
pub mod multivariate;
/// Task-conditional quality scoring
pub mod quality;
/// Persisted data model and CSV rows
pub mod record;
/// Single-run orchestration
pub mod run;
/// Interactive chat context persistence
pub mod session;
/// Descriptive-statistics helpers
pub mod stats;
/// Experiment sweep driver
pub mod sweep;
/// Background resource sampling
pub mod telemetry;

pub use error::{MedirError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
