//! Medir CLI - LLM benchmark harness
//!
//! Drives benchmark sweeps against an Ollama-compatible endpoint and
//! analyzes the resulting experiment directories offline.
//!
//! # Commands
//!
//! - `sweep` - Run a benchmark sweep (grid or explicit test cases)
//! - `analyze` - Analyze a finished experiment directory
//! - `models` - List models installed on the serving endpoint
//! - `chat` - One chat turn with persisted conversation context

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use medir::analyze::{run_analysis, AnalyzeOptions};
use medir::client::{GenerateOptions, OllamaClient, DEFAULT_ENDPOINT};
use medir::record::{LoadTier, TaskKind};
use medir::session::ChatSession;
use medir::sweep::{run_sweep, SweepOptions};
use medir::telemetry::{DEFAULT_CPU_TDP_W, DEFAULT_INTERVAL_MS};
use medir::Result;

/// Medir - benchmark harness for locally-hosted LLMs
///
/// Measures latency, throughput, energy and quality per run, with
/// offline multivariate analysis.
#[derive(Parser)]
#[command(name = "medir")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark sweep
    ///
    /// Examples:
    ///   medir sweep --models llama3.2:3b --runs 3
    ///   medir sweep --cases-file cases.json --use-default-on-error
    ///   medir sweep --dry-run --tasks qa code --loads short
    Sweep {
        /// Serving endpoint base URL
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Models to benchmark
        #[arg(long, num_args = 1..)]
        models: Option<Vec<String>>,

        /// Repetitions per (model, task, load) cell
        #[arg(long, default_value = "5")]
        runs: u32,

        /// Base output directory
        #[arg(long, default_value = "data")]
        out: PathBuf,

        /// Print the plan without running or writing anything
        #[arg(long)]
        dry_run: bool,

        /// Sampling temperature
        #[arg(long, default_value = "0.7")]
        temperature: f64,

        /// Nucleus sampling threshold
        #[arg(long, default_value = "0.9")]
        top_p: f64,

        /// Context window size
        #[arg(long, default_value = "4096")]
        num_ctx: u32,

        /// Token budget ceiling (load tiers cap below this)
        #[arg(long, default_value = "512")]
        max_tokens: u32,

        /// Sampling seed
        #[arg(long, default_value = "1234")]
        seed: i64,

        /// Issue a warm-up call before each measured run
        #[arg(long)]
        warmup: bool,

        /// keep_alive value sent with every request
        #[arg(long, default_value = "0s")]
        keepalive: String,

        /// Restrict to these tasks (qa, summary, code, creative)
        #[arg(long, num_args = 1.., value_parser = parse_task)]
        tasks: Option<Vec<TaskKind>>,

        /// Restrict to these load tiers (short, medium, long)
        #[arg(long, num_args = 1.., value_parser = parse_load)]
        loads: Option<Vec<LoadTier>>,

        /// Run inside an existing experiment directory
        #[arg(long)]
        exp_dir: Option<PathBuf>,

        /// Explicit test-case file (JSON array)
        #[arg(long)]
        cases_file: Option<PathBuf>,

        /// Per-sweep parameter override file (JSON)
        #[arg(long)]
        exp_config: Option<PathBuf>,

        /// Fall back to the default grid when the case file is invalid
        #[arg(long)]
        use_default_on_error: bool,

        /// Telemetry sampling interval, milliseconds
        #[arg(long, default_value_t = DEFAULT_INTERVAL_MS)]
        interval_ms: u64,

        /// CPU TDP used for the CPU energy estimate, watts
        #[arg(long, default_value_t = DEFAULT_CPU_TDP_W)]
        cpu_tdp_w: f64,

        /// BARTScore-style scoring service URL for semantic tasks
        #[arg(long)]
        bartscore_url: Option<String>,
    },
    /// Analyze a finished experiment directory
    ///
    /// Examples:
    ///   medir analyze --exp-dir data/experiments_1_20260824_120000
    Analyze {
        /// Experiment directory produced by `sweep`
        #[arg(long)]
        exp_dir: PathBuf,

        /// Output directory for reports (defaults to <exp-dir>/analysis)
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },
    /// List models installed on the serving endpoint
    Models {
        /// Serving endpoint base URL
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },
    /// One chat turn with persisted conversation context
    ///
    /// Examples:
    ///   medir chat llama3.2:3b "继续上一个话题"
    Chat {
        /// Model name
        #[arg(value_name = "MODEL")]
        model: String,

        /// Prompt for this turn
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Serving endpoint base URL
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Sampling temperature
        #[arg(long, default_value = "0.7")]
        temperature: f64,

        /// Token budget for the reply
        #[arg(long, default_value = "512")]
        max_tokens: u32,

        /// Forget the saved conversation before sending
        #[arg(long)]
        reset: bool,
    },
}

fn parse_task(s: &str) -> std::result::Result<TaskKind, String> {
    TaskKind::parse(s).ok_or_else(|| format!("unknown task: {s}"))
}

fn parse_load(s: &str) -> std::result::Result<LoadTier, String> {
    LoadTier::parse(s).ok_or_else(|| format!("unknown load tier: {s}"))
}

#[allow(clippy::too_many_lines)]
fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sweep {
            endpoint,
            models,
            runs,
            out,
            dry_run,
            temperature,
            top_p,
            num_ctx,
            max_tokens,
            seed,
            warmup,
            keepalive,
            tasks,
            loads,
            exp_dir,
            cases_file,
            exp_config,
            use_default_on_error,
            interval_ms,
            cpu_tdp_w,
            bartscore_url,
        } => {
            let defaults = SweepOptions::default();
            let opts = SweepOptions {
                endpoint,
                models: models.unwrap_or(defaults.models),
                runs,
                out,
                dry_run,
                temperature,
                top_p,
                num_ctx,
                max_tokens,
                seed,
                warmup,
                keepalive,
                tasks,
                loads,
                exp_dir,
                cases_file,
                exp_config,
                use_default_on_error,
                interval_ms,
                cpu_tdp_w,
                bartscore_url,
            };
            let outcome = run_sweep(&opts)?;
            if !outcome.dry_run {
                println!(
                    "sweep finished: {} completed, {} failed, artifacts in {}",
                    outcome.completed,
                    outcome.failed,
                    outcome.exp_dir.display()
                );
            }
            Ok(())
        }
        Commands::Analyze {
            exp_dir,
            results_dir,
        } => {
            run_analysis(&AnalyzeOptions {
                exp_dir,
                results_dir,
            })?;
            Ok(())
        }
        Commands::Models { endpoint } => {
            let client = OllamaClient::new(&endpoint)?;
            let models = client.installed_models()?;
            if models.is_empty() {
                println!("no models installed at {endpoint}");
                return Ok(());
            }
            for model in models {
                let size = model.parameter_size.as_deref().unwrap_or("?");
                let quant = model.quantization_level.as_deref().unwrap_or("?");
                println!("{:<32} {size:>8} {quant}", model.name);
            }
            Ok(())
        }
        Commands::Chat {
            model,
            prompt,
            endpoint,
            temperature,
            max_tokens,
            reset,
        } => {
            let client = OllamaClient::new(&endpoint)?;
            let session = ChatSession::open();
            if reset {
                session.clear()?;
            }
            let options = GenerateOptions {
                num_ctx: 4096,
                temperature,
                top_p: 0.9,
                seed: 0,
                max_tokens,
            };
            let result = session.send(&client, &model, &prompt, &options, "5m")?;
            println!("{}", result.text);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
