//! Persisted data model: task kinds, load tiers, per-run records and
//! the CSV summary/statistics rows.
//!
//! `RunRecord` is the single source of truth for a run; the CSV rows
//! are projections of it. Records round-trip through JSON exactly, and
//! grouped statistics use the population standard deviation.

use serde::{Deserialize, Serialize};

use crate::client::{GenerateOptions, ModelInfo};
use crate::quality::QualityScore;
use crate::stats;
use crate::telemetry::{TelemetrySummary, TelemetryTrace};

// ============================================================================
// Keys
// ============================================================================

/// Benchmark task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Qa,
    Summary,
    Code,
    Creative,
}

impl TaskKind {
    /// All task kinds, in canonical order.
    pub const ALL: [TaskKind; 4] = [Self::Qa, Self::Summary, Self::Code, Self::Creative];

    /// Parse a task name, accepting the long-form aliases used by
    /// explicit test-case files.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "qa" | "knowledge_qa" => Some(Self::Qa),
            "summary" | "text_summarization" => Some(Self::Summary),
            "code" | "code_generation" => Some(Self::Code),
            "creative" | "creative_writing" => Some(Self::Creative),
            _ => None,
        }
    }

    /// Canonical short name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Qa => "qa",
            Self::Summary => "summary",
            Self::Code => "code",
            Self::Creative => "creative",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output-length tier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTier {
    Short,
    Medium,
    Long,
    /// Explicit test-case runs, which carry their own token budget
    Custom,
}

impl LoadTier {
    /// The sweep-grid tiers, shortest first.
    pub const ALL: [LoadTier; 3] = [Self::Short, Self::Medium, Self::Long];

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "short" => Some(Self::Short),
            "medium" => Some(Self::Medium),
            "long" => Some(Self::Long),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::Custom => "custom",
        }
    }

    /// Token budget for this tier given the configured maximum.
    #[must_use]
    pub fn token_budget(self, max_tokens: u32) -> u32 {
        match self {
            Self::Short => max_tokens.min(128),
            Self::Medium => max_tokens.min(256),
            Self::Long | Self::Custom => max_tokens,
        }
    }
}

impl std::fmt::Display for LoadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Run specification and record
// ============================================================================

/// Everything needed to execute one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub model: String,
    pub task: TaskKind,
    pub load: LoadTier,
    /// 1-based run index within the (model, task, load) group
    pub run: u32,
    pub prompt: String,
    /// Reference text for semantic scoring, when the task has one
    pub reference: Option<String>,
    pub options: GenerateOptions,
    pub keep_alive: String,
    /// Whether a warm-up call precedes the measured call
    pub warmup: bool,
}

/// Engine-reported counters from the terminal stream frame. All
/// durations are nanoseconds; engines may omit any of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub eval_count: Option<u64>,
    pub eval_duration_ns: Option<u64>,
    pub total_duration_ns: Option<u64>,
    pub load_duration_ns: Option<u64>,
    pub prompt_eval_duration_ns: Option<u64>,
}

impl ApiMetrics {
    /// Decode throughput from the engine counters, when both are
    /// present and the duration is non-zero.
    #[must_use]
    pub fn tokens_per_second(&self) -> Option<f64> {
        match (self.eval_count, self.eval_duration_ns) {
            (Some(count), Some(ns)) if ns > 0 => Some(count as f64 / (ns as f64 / 1e9)),
            _ => None,
        }
    }
}

/// Complete persisted record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// RFC 3339 capture time
    pub timestamp: String,
    pub spec: RunSpec,
    /// Generated text
    pub output: String,
    /// Wall-clock latency of the measured call, seconds
    pub latency_s: f64,
    /// Wall-clock time to first token, seconds
    pub first_token_s: Option<f64>,
    /// Engine-derived throughput, tokens per second
    pub toks_per_s: Option<f64>,
    /// Whether the reduced-shape retry produced this result
    pub retried: bool,
    pub api: ApiMetrics,
    pub telemetry: TelemetrySummary,
    pub trace: TelemetryTrace,
    pub quality: QualityScore,
    /// Endpoint metadata for the model, when discoverable
    pub model_info: Option<ModelInfo>,
}

impl RunRecord {
    /// Project this record onto its results.csv row.
    #[must_use]
    pub fn summary_row(&self) -> SummaryRow {
        SummaryRow {
            timestamp: self.timestamp.clone(),
            model: self.spec.model.clone(),
            task: self.spec.task,
            load: self.spec.load,
            run: self.spec.run,
            latency_s: self.latency_s,
            toks_per_s: self.toks_per_s,
            gpu_mem_peak_mb: self.telemetry.gpu_mem_peak_mb,
            gpu_util_avg: self.telemetry.gpu_util_mean,
            gpu_energy_j: self.telemetry.gpu_energy_j,
            bartscore: self.quality.semantic_score(),
        }
    }
}

// ============================================================================
// CSV rows
// ============================================================================

/// One row of `summary/results.csv`, appended in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub timestamp: String,
    pub model: String,
    pub task: TaskKind,
    pub load: LoadTier,
    pub run: u32,
    pub latency_s: f64,
    pub toks_per_s: Option<f64>,
    pub gpu_mem_peak_mb: f64,
    pub gpu_util_avg: f64,
    pub gpu_energy_j: f64,
    pub bartscore: Option<f64>,
}

/// One row of `summary/stats.csv`: aggregates over a (model, task,
/// load) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub model: String,
    pub task: TaskKind,
    pub load: LoadTier,
    pub count: usize,
    pub latency_mean: f64,
    pub latency_std: f64,
    pub tps_mean: f64,
    pub tps_std: f64,
    pub gmem_peak_mean: f64,
    pub gutil_mean: f64,
    pub energy_j_mean: f64,
    /// Mean over rows that carry a semantic score; empty when none do
    pub bartscore_mean: Option<f64>,
}

impl GroupStats {
    /// Aggregate one (model, task, load) group. Standard deviations
    /// use the population form.
    #[must_use]
    pub fn from_rows(model: &str, task: TaskKind, load: LoadTier, rows: &[&SummaryRow]) -> Self {
        let latencies: Vec<f64> = rows.iter().map(|r| r.latency_s).collect();
        let tps: Vec<f64> = rows.iter().filter_map(|r| r.toks_per_s).collect();
        let gmem: Vec<f64> = rows.iter().map(|r| r.gpu_mem_peak_mb).collect();
        let gutil: Vec<f64> = rows.iter().map(|r| r.gpu_util_avg).collect();
        let energy: Vec<f64> = rows.iter().map(|r| r.gpu_energy_j).collect();
        let bart: Vec<f64> = rows.iter().filter_map(|r| r.bartscore).collect();
        Self {
            model: model.to_string(),
            task,
            load,
            count: rows.len(),
            latency_mean: stats::mean(&latencies),
            latency_std: stats::std_dev(&latencies),
            tps_mean: stats::mean(&tps),
            tps_std: stats::std_dev(&tps),
            gmem_peak_mean: stats::mean(&gmem),
            gutil_mean: stats::mean(&gutil),
            energy_j_mean: stats::mean(&energy),
            bartscore_mean: if bart.is_empty() {
                None
            } else {
                Some(stats::mean(&bart))
            },
        }
    }
}

// ============================================================================
// Artifact naming
// ============================================================================

/// Model name made filesystem-safe for per-model directories.
#[must_use]
pub fn sanitize_model(name: &str) -> String {
    name.replace([':', '/'], "_")
}

/// File stem for a run's artifacts, `<task>_<load>_r<run>`.
#[must_use]
pub fn artifact_stem(task: TaskKind, load: LoadTier, run: u32) -> String {
    format!("{task}_{load}_r{run}")
}
