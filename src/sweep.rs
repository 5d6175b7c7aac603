//! Experiment sweep driver: plan construction, test-case validation,
//! output layout and the run loop.
//!
//! A sweep is either the default cross-product (model x task x load x
//! run) over the built-in task table, or the expansion of an explicit
//! test-case file. Explicit cases are validated up front; the problem
//! list either aborts the sweep (exit code 2) or, under
//! `use_default_on_error`, falls back to the default grid.
//!
//! Output lands in `experiments_<index>_<timestamp>` under the base
//! output directory: `raw/` and `texts/` per-model artifacts, a
//! `summary/` with `results.csv` (one row per run, appended in
//! execution order) and `stats.csv` (grouped aggregates), and a
//! `config.json` snapshot. Dry-run prints the plan and touches
//! nothing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::{GenerateOptions, OllamaClient, DEFAULT_ENDPOINT};
use crate::error::{MedirError, Result};
use crate::quality::SemanticScorer;
use crate::record::{GroupStats, LoadTier, RunSpec, SummaryRow, TaskKind};
use crate::run::{execute_run, RunContext};
use crate::telemetry::{MonitorConfig, DEFAULT_CPU_TDP_W, DEFAULT_INTERVAL_MS};

/// Models benchmarked when none are given.
pub const DEFAULT_MODELS: [&str; 3] = ["llama3.2:3b", "llama3.2:11b", "gemma2:9b"];

// ============================================================================
// Options
// ============================================================================

/// Fully-resolved sweep parameters.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub endpoint: String,
    pub models: Vec<String>,
    pub runs: u32,
    pub out: PathBuf,
    pub dry_run: bool,
    pub temperature: f64,
    pub top_p: f64,
    pub num_ctx: u32,
    pub max_tokens: u32,
    pub seed: i64,
    pub warmup: bool,
    pub keepalive: String,
    /// Restrict the grid to these tasks (all four when `None`)
    pub tasks: Option<Vec<TaskKind>>,
    /// Restrict the grid to these load tiers (all three when `None`)
    pub loads: Option<Vec<LoadTier>>,
    /// Run inside an existing experiment directory instead of
    /// allocating a fresh one
    pub exp_dir: Option<PathBuf>,
    pub cases_file: Option<PathBuf>,
    pub exp_config: Option<PathBuf>,
    pub use_default_on_error: bool,
    pub interval_ms: u64,
    pub cpu_tdp_w: f64,
    pub bartscore_url: Option<String>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            models: DEFAULT_MODELS.iter().map(ToString::to_string).collect(),
            runs: 5,
            out: PathBuf::from("data"),
            dry_run: false,
            temperature: 0.7,
            top_p: 0.9,
            num_ctx: 4096,
            max_tokens: 512,
            seed: 1234,
            warmup: false,
            keepalive: "0s".to_string(),
            tasks: None,
            loads: None,
            exp_dir: None,
            cases_file: None,
            exp_config: None,
            use_default_on_error: false,
            interval_ms: DEFAULT_INTERVAL_MS,
            cpu_tdp_w: DEFAULT_CPU_TDP_W,
            bartscore_url: None,
        }
    }
}

/// Optional per-sweep override file (JSON). Absent keys keep the CLI
/// values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpConfig {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub num_ctx: Option<u32>,
    pub seed: Option<i64>,
    pub keepalive: Option<String>,
    pub warmup: Option<bool>,
    pub runs: Option<u32>,
}

impl SweepOptions {
    fn apply_override(&mut self, cfg: &ExpConfig) {
        if let Some(v) = cfg.temperature {
            self.temperature = v;
        }
        if let Some(v) = cfg.top_p {
            self.top_p = v;
        }
        if let Some(v) = cfg.num_ctx {
            self.num_ctx = v;
        }
        if let Some(v) = cfg.seed {
            self.seed = v;
        }
        if let Some(v) = &cfg.keepalive {
            self.keepalive = v.clone();
        }
        if let Some(v) = cfg.warmup {
            self.warmup = v;
        }
        if let Some(v) = cfg.runs {
            self.runs = v;
        }
    }

    fn base_options(&self, max_tokens: u32) -> GenerateOptions {
        GenerateOptions {
            num_ctx: self.num_ctx,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            max_tokens,
        }
    }
}

// ============================================================================
// Built-in task table
// ============================================================================

/// Prompt and optional scoring reference for a built-in task.
#[derive(Debug, Clone, Copy)]
pub struct TaskPrompt {
    pub prompt: &'static str,
    pub reference: Option<&'static str>,
}

/// The default benchmark prompt for each task kind.
#[must_use]
pub fn builtin_task(task: TaskKind) -> TaskPrompt {
    match task {
        TaskKind::Qa => TaskPrompt {
            prompt: "请解释牛顿第一定律。",
            reference: Some(
                "牛顿第一定律也称惯性定律,当物体所受合外力为零时,静止保持静止,运动保持匀速直线运动。",
            ),
        },
        TaskKind::Summary => TaskPrompt {
            prompt: "请阅读并总结以下文本,给出200字摘要: 牛顿第一定律描述了物体在不受外力作用时的运动状态,强调惯性的概念。",
            reference: Some("该定律表明无外力时物体保持原有状态,体现惯性。"),
        },
        TaskKind::Code => TaskPrompt {
            prompt: "请用Python实现二分查找并解释时间复杂度。",
            reference: None,
        },
        TaskKind::Creative => TaskPrompt {
            prompt: "以\"人工智能与未来社会\"为题写一段约300字短文。",
            reference: None,
        },
    }
}

// ============================================================================
// Test-case validation
// ============================================================================

const REQUIRED_CASE_KEYS: [&str; 5] = ["model", "prompt", "task_type", "max_tokens", "temperature"];

/// Validate explicit test cases, returning one problem string per
/// violation (empty when the file is usable).
#[must_use]
pub fn validate_cases(cases: &[Value]) -> Vec<String> {
    let mut problems = Vec::new();
    for (i, case) in cases.iter().enumerate() {
        for key in REQUIRED_CASE_KEYS {
            let missing = match case.get(key) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                problems.push(format!("case[{i}] missing {key}"));
            }
        }
        let max_tokens_ok = case
            .get("max_tokens")
            .and_then(Value::as_f64)
            .is_some_and(|v| v > 0.0);
        if !max_tokens_ok {
            problems.push(format!("case[{i}] invalid max_tokens"));
        }
        let temperature = match case.get("temperature") {
            None => Some(0.7),
            Some(v) => numeric(v),
        };
        if !temperature.is_some_and(|t| (0.0..=2.0).contains(&t)) {
            problems.push(format!("case[{i}] invalid temperature"));
        }
        match case.get("model") {
            Some(Value::Array(models)) => {
                if models.is_empty() {
                    problems.push(format!("case[{i}] model list empty"));
                } else {
                    for (j, model) in models.iter().enumerate() {
                        let ok = model.as_str().is_some_and(|s| !s.trim().is_empty());
                        if !ok {
                            problems.push(format!("case[{i}] model[{j}] invalid"));
                        }
                    }
                }
            }
            Some(Value::String(s)) => {
                if s.trim().is_empty() {
                    problems.push(format!("case[{i}] model string empty"));
                }
            }
            _ => problems.push(format!("case[{i}] model type invalid")),
        }
    }
    problems
}

fn numeric(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn load_cases(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)?;
    let cases: Vec<Value> = serde_json::from_str(&text)?;
    Ok(cases)
}

fn resolve_case_models(value: &Value, client: &OllamaClient) -> Vec<String> {
    match value {
        Value::Array(models) => models
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string)
            .collect(),
        Value::String(s) if s.trim().eq_ignore_ascii_case("all") => client
            .installed_models()
            .map(|models| models.into_iter().map(|m| m.name).collect())
            .unwrap_or_default(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Fully-expanded run plan, shared by dry-run printing and execution.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub models: Vec<String>,
    pub tasks: Vec<TaskKind>,
    pub loads: Vec<LoadTier>,
    pub runs: u32,
    pub specs: Vec<RunSpec>,
}

/// Expand the default cross-product over the built-in task table.
#[must_use]
pub fn default_plan(opts: &SweepOptions) -> SweepPlan {
    let tasks: Vec<TaskKind> = opts
        .tasks
        .clone()
        .unwrap_or_else(|| TaskKind::ALL.to_vec());
    let loads: Vec<LoadTier> = opts
        .loads
        .clone()
        .unwrap_or_else(|| LoadTier::ALL.to_vec());
    let mut specs = Vec::new();
    for model in &opts.models {
        for &task in &tasks {
            let prompt = builtin_task(task);
            for &load in &loads {
                for run in 1..=opts.runs {
                    specs.push(RunSpec {
                        model: model.clone(),
                        task,
                        load,
                        run,
                        prompt: prompt.prompt.to_string(),
                        reference: prompt.reference.map(ToString::to_string),
                        options: opts.base_options(load.token_budget(opts.max_tokens)),
                        keep_alive: opts.keepalive.clone(),
                        warmup: opts.warmup,
                    });
                }
            }
        }
    }
    SweepPlan {
        models: opts.models.clone(),
        tasks,
        loads,
        runs: opts.runs,
        specs,
    }
}

/// Expand validated explicit cases. Runs are numbered globally across
/// the file under the `custom` load tier.
fn case_plan(cases: &[Value], opts: &SweepOptions, client: &OllamaClient) -> SweepPlan {
    let mut specs = Vec::new();
    let mut models = Vec::new();
    let mut tasks = Vec::new();
    let mut run = 1u32;
    for case in cases {
        let task = case
            .get("task_type")
            .and_then(Value::as_str)
            .and_then(TaskKind::parse)
            .unwrap_or(TaskKind::Qa);
        let prompt = case
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reference = case
            .get("reference_text")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let max_tokens = case
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map_or(opts.max_tokens, |v| v as u32);
        let temperature = case
            .get("temperature")
            .and_then(numeric)
            .unwrap_or(opts.temperature);
        let model_value = case.get("model").cloned().unwrap_or(Value::Null);
        for model in resolve_case_models(&model_value, client) {
            if !models.contains(&model) {
                models.push(model.clone());
            }
            if !tasks.contains(&task) {
                tasks.push(task);
            }
            specs.push(RunSpec {
                model,
                task,
                load: LoadTier::Custom,
                run,
                prompt: prompt.clone(),
                reference: reference.clone(),
                options: GenerateOptions {
                    temperature,
                    ..opts.base_options(max_tokens)
                },
                keep_alive: opts.keepalive.clone(),
                warmup: opts.warmup,
            });
            run += 1;
        }
    }
    SweepPlan {
        models,
        tasks,
        loads: vec![LoadTier::Custom],
        runs: 1,
        specs,
    }
}

// ============================================================================
// Output layout
// ============================================================================

/// Next free experiment index under `base_out`: one past the highest
/// `experiments_<n>_...` already present, starting at 1.
#[must_use]
pub fn next_experiment_index(base_out: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(base_out) else {
        return 1;
    };
    let mut index = 1;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rest) = name.strip_prefix("experiments_") {
            if let Some(n) = rest.split('_').next().and_then(|p| p.parse::<u32>().ok()) {
                index = index.max(n + 1);
            }
        }
    }
    index
}

#[derive(Serialize)]
struct ConfigSnapshot<'a> {
    timestamp: &'a str,
    models: &'a [String],
    runs: u32,
    temperature: f64,
    top_p: f64,
    num_ctx: u32,
    max_tokens: u32,
    seed: i64,
    warmup: bool,
    keepalive: &'a str,
    endpoint: &'a str,
    exp_config_path: Option<&'a Path>,
    cases_file: Option<&'a Path>,
}

/// Outcome of a sweep invocation.
#[derive(Debug)]
pub struct SweepOutcome {
    /// Experiment directory (for dry-run, the directory that would be
    /// used)
    pub exp_dir: PathBuf,
    pub dry_run: bool,
    pub completed: usize,
    pub failed: usize,
}

// ============================================================================
// Driver
// ============================================================================

/// Run a full sweep (or print its plan under dry-run).
pub fn run_sweep(options: &SweepOptions) -> Result<SweepOutcome> {
    let mut opts = options.clone();
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

    // An existing experiment directory supplies its own cases and
    // override files unless the flags name others.
    if let Some(dir) = opts.exp_dir.clone() {
        if opts.exp_config.is_none() {
            let candidate = dir.join("exp_config.json");
            if candidate.exists() {
                opts.exp_config = Some(candidate);
            }
        }
        if opts.cases_file.is_none() {
            let candidate = dir.join("test_cases.json");
            if candidate.exists() {
                opts.cases_file = Some(candidate);
            }
        }
    }
    if let Some(path) = opts.exp_config.clone() {
        match fs::read_to_string(&path)
            .map_err(MedirError::from)
            .and_then(|text| serde_json::from_str::<ExpConfig>(&text).map_err(MedirError::from))
        {
            Ok(cfg) => opts.apply_override(&cfg),
            Err(e) => warn!("ignoring unreadable override file {}: {e}", path.display()),
        }
    }

    let client = OllamaClient::new(&opts.endpoint)?;

    let cases = match &opts.cases_file {
        Some(path) => match load_cases(path) {
            Ok(cases) => {
                let problems = validate_cases(&cases);
                if problems.is_empty() {
                    Some(cases)
                } else if opts.use_default_on_error {
                    warn!(
                        "case validation failed, falling back to default tasks: {}",
                        problems.join("; ")
                    );
                    None
                } else {
                    return Err(MedirError::Validation { problems });
                }
            }
            Err(e) => {
                if opts.use_default_on_error {
                    warn!("cases file unreadable, falling back to default tasks: {e}");
                    None
                } else {
                    return Err(MedirError::Validation {
                        problems: vec![format!("cases file unreadable: {e}")],
                    });
                }
            }
        },
        None => None,
    };

    let plan = match &cases {
        Some(cases) => case_plan(cases, &opts, &client),
        None => default_plan(&opts),
    };

    let exp_dir = opts.exp_dir.clone().unwrap_or_else(|| {
        let index = next_experiment_index(&opts.out);
        opts.out.join(format!("experiments_{index}_{timestamp}"))
    });

    if opts.dry_run {
        println!("models: {}", plan.models.join(", "));
        println!(
            "tasks: {}",
            plan.tasks.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
        );
        println!(
            "loads: {}",
            plan.loads.iter().map(|l| l.name()).collect::<Vec<_>>().join(", ")
        );
        println!("runs per cell: {}", plan.runs);
        println!("total runs: {}", plan.specs.len());
        println!("output directory: {}", exp_dir.display());
        if let Some(path) = &opts.cases_file {
            println!("cases file: {}", path.display());
        }
        if let Some(path) = &opts.exp_config {
            println!("override file: {}", path.display());
        }
        return Ok(SweepOutcome {
            exp_dir,
            dry_run: true,
            completed: 0,
            failed: 0,
        });
    }

    let summary_dir = exp_dir.join("summary");
    fs::create_dir_all(exp_dir.join("raw"))?;
    fs::create_dir_all(exp_dir.join("texts"))?;
    fs::create_dir_all(&summary_dir)?;

    let snapshot = ConfigSnapshot {
        timestamp: &timestamp,
        models: &plan.models,
        runs: opts.runs,
        temperature: opts.temperature,
        top_p: opts.top_p,
        num_ctx: opts.num_ctx,
        max_tokens: opts.max_tokens,
        seed: opts.seed,
        warmup: opts.warmup,
        keepalive: &opts.keepalive,
        endpoint: &opts.endpoint,
        exp_config_path: opts.exp_config.as_deref(),
        cases_file: opts.cases_file.as_deref(),
    };
    fs::write(
        exp_dir.join("config.json"),
        serde_json::to_vec_pretty(&snapshot)?,
    )?;
    if let Some(path) = &opts.cases_file {
        let dest = exp_dir.join("test_cases.json");
        if path != &dest {
            fs::copy(path, dest)?;
        }
    }
    if let Some(path) = &opts.exp_config {
        let dest = exp_dir.join("exp_config.json");
        if path != &dest {
            fs::copy(path, dest)?;
        }
    }

    let scorer = opts
        .bartscore_url
        .as_deref()
        .and_then(SemanticScorer::new);
    let ctx = RunContext {
        client: &client,
        scorer: scorer.as_ref(),
        monitor_config: MonitorConfig {
            interval: std::time::Duration::from_millis(opts.interval_ms),
            cpu_tdp_w: opts.cpu_tdp_w,
        },
    };

    let results_path = summary_dir.join("results.csv");
    let mut writer = csv::Writer::from_path(&results_path)?;
    let mut rows: Vec<SummaryRow> = Vec::new();
    let mut failed = 0usize;
    let total = plan.specs.len();
    for (i, spec) in plan.specs.iter().enumerate() {
        info!(
            model = %spec.model,
            task = %spec.task,
            load = %spec.load,
            run = spec.run,
            "run {}/{total}",
            i + 1
        );
        match execute_run(&ctx, spec, &exp_dir) {
            Ok(row) => {
                writer.serialize(&row)?;
                writer.flush()?;
                rows.push(row);
            }
            Err(e) => {
                failed += 1;
                error!(
                    model = %spec.model,
                    task = %spec.task,
                    load = %spec.load,
                    run = spec.run,
                    "run failed, continuing: {e}"
                );
            }
        }
    }
    writer.flush()?;

    let stats_path = summary_dir.join("stats.csv");
    let mut stats_writer = csv::Writer::from_path(&stats_path)?;
    for group in group_stats(&rows) {
        stats_writer.serialize(&group)?;
    }
    stats_writer.flush()?;

    println!("results written: {}", results_path.display());
    println!("stats written: {}", stats_path.display());
    Ok(SweepOutcome {
        exp_dir,
        dry_run: false,
        completed: rows.len(),
        failed,
    })
}

/// Aggregate rows into (model, task, load) groups, preserving
/// first-appearance order.
#[must_use]
pub fn group_stats(rows: &[SummaryRow]) -> Vec<GroupStats> {
    let mut order: Vec<(String, TaskKind, LoadTier)> = Vec::new();
    let mut groups: HashMap<(String, TaskKind, LoadTier), Vec<&SummaryRow>> = HashMap::new();
    for row in rows {
        let key = (row.model.clone(), row.task, row.load);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }
    order
        .into_iter()
        .map(|key| GroupStats::from_rows(&key.0, key.1, key.2, &groups[&key]))
        .collect()
}
