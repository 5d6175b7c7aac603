//! Single-run orchestration: warm-up, telemetry capture around the
//! measured call, quality scoring and artifact persistence.
//!
//! A run that fails leaves no artifact behind: the record is written
//! to a temporary sibling and renamed into place only once complete.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::client::OllamaClient;
use crate::error::Result;
use crate::quality::{score_output, SemanticScorer};
use crate::record::{artifact_stem, sanitize_model, RunRecord, RunSpec, SummaryRow};
use crate::telemetry::{MonitorConfig, ResourceMonitor};

/// Token budget for the warm-up call.
const WARMUP_MAX_TOKENS: u32 = 16;

/// Shared collaborators for run execution.
pub struct RunContext<'a> {
    pub client: &'a OllamaClient,
    pub scorer: Option<&'a SemanticScorer>,
    pub monitor_config: MonitorConfig,
}

/// Execute one run and persist its artifacts under `exp_dir`.
///
/// Layout: `raw/<model>/<task>_<load>_r<run>.json` holds the full
/// record, `texts/<model>/<task>_<load>_r<run>.txt` the bare output.
/// Model names are made filesystem-safe first.
pub fn execute_run(ctx: &RunContext<'_>, spec: &RunSpec, exp_dir: &Path) -> Result<SummaryRow> {
    if spec.warmup {
        warm_up(ctx.client, spec);
    }

    let monitor = ResourceMonitor::start(ctx.monitor_config.clone());
    let generation = ctx.client.generate_with_retry(
        &spec.model,
        &spec.prompt,
        &spec.options,
        &spec.keep_alive,
    );
    let trace = monitor.stop();

    let generation = generation?;
    let quality = score_output(
        spec.task,
        &generation.text,
        spec.reference.as_deref(),
        ctx.scorer,
    );
    let model_info = ctx.client.model_details(&spec.model).unwrap_or_default();

    let record = RunRecord {
        timestamp: Utc::now().to_rfc3339(),
        spec: spec.clone(),
        output: generation.text,
        latency_s: generation.latency_s,
        first_token_s: generation.first_token_s,
        toks_per_s: generation.metrics.tokens_per_second(),
        retried: generation.retried,
        api: generation.metrics,
        telemetry: trace.summarize(),
        trace,
        quality,
        model_info,
    };

    persist_record(&record, exp_dir)?;
    info!(
        model = %spec.model,
        task = %spec.task,
        load = %spec.load,
        run = spec.run,
        latency_s = record.latency_s,
        "run complete"
    );
    Ok(record.summary_row())
}

fn warm_up(client: &OllamaClient, spec: &RunSpec) {
    let mut options = spec.options.clone();
    options.num_ctx = (spec.options.num_ctx / 2).max(512);
    options.max_tokens = WARMUP_MAX_TOKENS;
    // Result and errors are both discarded; warm-up only loads the
    // model into memory.
    if let Err(e) =
        client.generate_stream(&spec.model, &spec.prompt, &options, &spec.keep_alive, None)
    {
        debug!(model = %spec.model, "warm-up call failed: {e}");
    }
}

/// Destination of a run's record file within `exp_dir`.
#[must_use]
pub fn record_path(exp_dir: &Path, spec: &RunSpec) -> PathBuf {
    exp_dir
        .join("raw")
        .join(sanitize_model(&spec.model))
        .join(format!("{}.json", artifact_stem(spec.task, spec.load, spec.run)))
}

/// Destination of a run's text copy within `exp_dir`.
#[must_use]
pub fn text_path(exp_dir: &Path, spec: &RunSpec) -> PathBuf {
    exp_dir
        .join("texts")
        .join(sanitize_model(&spec.model))
        .join(format!("{}.txt", artifact_stem(spec.task, spec.load, spec.run)))
}

fn persist_record(record: &RunRecord, exp_dir: &Path) -> Result<()> {
    let json_path = record_path(exp_dir, &record.spec);
    write_json_atomic(&json_path, record)?;
    let txt_path = text_path(exp_dir, &record.spec);
    if let Some(parent) = txt_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&txt_path, &record.output)?;
    Ok(())
}

/// Serialize `value` to `path` via a temporary sibling and rename, so
/// a failure mid-write leaves no partial file at `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GenerateOptions;
    use crate::record::{LoadTier, TaskKind};
    use tempfile::TempDir;

    fn spec() -> RunSpec {
        RunSpec {
            model: "llama3.2:3b".to_string(),
            task: TaskKind::Qa,
            load: LoadTier::Short,
            run: 1,
            prompt: "什么是牛顿第一定律？".to_string(),
            reference: Some("物体在不受外力时保持静止或匀速直线运动。".to_string()),
            options: GenerateOptions {
                num_ctx: 4096,
                temperature: 0.7,
                top_p: 0.9,
                seed: 1234,
                max_tokens: 128,
            },
            keep_alive: "0s".to_string(),
            warmup: false,
        }
    }

    #[test]
    fn test_artifact_paths_sanitize_model() {
        let dir = Path::new("/tmp/exp");
        let s = spec();
        assert_eq!(
            record_path(dir, &s),
            Path::new("/tmp/exp/raw/llama3.2_3b/qa_short_r1.json")
        );
        assert_eq!(
            text_path(dir, &s),
            Path::new("/tmp/exp/texts/llama3.2_3b/qa_short_r1.txt")
        );
    }

    #[test]
    fn test_write_json_atomic_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("record.json");
        write_json_atomic(&path, &spec()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let back: RunSpec = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, spec());
    }

    #[test]
    fn test_failed_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        // Unroutable port: the generate call fails before any artifact
        // is produced.
        let client = OllamaClient::with_timeout(
            "http://127.0.0.1:9",
            std::time::Duration::from_millis(500),
        )
        .unwrap();
        let ctx = RunContext {
            client: &client,
            scorer: None,
            monitor_config: MonitorConfig {
                interval: std::time::Duration::from_millis(10),
                ..MonitorConfig::default()
            },
        };
        let result = execute_run(&ctx, &spec(), dir.path());
        assert!(result.is_err());
        assert!(!dir.path().join("raw").exists());
        assert!(!dir.path().join("texts").exists());
    }
}
