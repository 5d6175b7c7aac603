//! Offline composite analysis of a finished experiment directory.
//!
//! Joins `summary/results.csv` with the per-run raw records to obtain
//! one unified quality value per run, normalizes throughput, latency,
//! energy and quality within each task, and derives two composites:
//!
//! - efficiency score: 0.4 * throughput + 0.3 * latency + 0.3 * energy
//!   (all normalized, latency and energy inverted so higher is better),
//! - quality-to-cost ratio: (quality + 0.01) / (1.01 - efficiency).
//!
//! Emits `analysis_data.csv`, a Markdown report with rankings and
//! ASCII charts, and the multivariate statistics report.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MedirError, Result};
use crate::multivariate;
use crate::record::{GroupStats, LoadTier, RunRecord, SummaryRow, TaskKind};
use crate::stats::{self, Direction};

/// Weights of the efficiency composite.
const W_THROUGHPUT: f64 = 0.4;
const W_LATENCY: f64 = 0.3;
const W_ENERGY: f64 = 0.3;

// ============================================================================
// Analysis rows
// ============================================================================

/// One run with its normalized metrics and composites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub model: String,
    pub task: TaskKind,
    pub load: LoadTier,
    pub run: u32,
    pub latency_s: f64,
    pub toks_per_s: f64,
    pub gpu_mem_peak_mb: f64,
    pub gpu_util_avg: f64,
    pub gpu_energy_j: f64,
    /// Unified quality: compile success for code, distinct-2 for
    /// creative, the semantic score otherwise (0.0 when absent)
    pub quality_raw: f64,
    pub norm_tps: f64,
    pub norm_lat: f64,
    pub norm_energy: f64,
    pub norm_quality: f64,
    pub efficiency_score: f64,
    pub qe_ratio: f64,
}

type RunKey = (String, TaskKind, LoadTier, u32);

/// Build analysis rows: join, normalize per task, derive composites.
#[must_use]
pub fn build_analysis(rows: &[SummaryRow], unified: &HashMap<RunKey, f64>) -> Vec<AnalysisRow> {
    let mut out: Vec<AnalysisRow> = rows
        .iter()
        .map(|r| {
            let key = (r.model.clone(), r.task, r.load, r.run);
            let quality_raw = unified
                .get(&key)
                .copied()
                .or(r.bartscore)
                .unwrap_or(0.0);
            AnalysisRow {
                model: r.model.clone(),
                task: r.task,
                load: r.load,
                run: r.run,
                latency_s: r.latency_s,
                toks_per_s: r.toks_per_s.unwrap_or(0.0),
                gpu_mem_peak_mb: r.gpu_mem_peak_mb,
                gpu_util_avg: r.gpu_util_avg,
                gpu_energy_j: r.gpu_energy_j,
                quality_raw,
                norm_tps: 0.0,
                norm_lat: 0.0,
                norm_energy: 0.0,
                norm_quality: 0.0,
                efficiency_score: 0.0,
                qe_ratio: 0.0,
            }
        })
        .collect();

    // Normalize within each task so tasks with different scales never
    // compete against each other.
    let mut by_task: HashMap<TaskKind, Vec<usize>> = HashMap::new();
    for (i, row) in out.iter().enumerate() {
        by_task.entry(row.task).or_default().push(i);
    }
    for indices in by_task.values() {
        normalize_into(&mut out, indices, |r| r.toks_per_s, Direction::HigherBetter, |r, v| {
            r.norm_tps = v;
        });
        normalize_into(&mut out, indices, |r| r.latency_s, Direction::LowerBetter, |r, v| {
            r.norm_lat = v;
        });
        normalize_into(&mut out, indices, |r| r.gpu_energy_j, Direction::LowerBetter, |r, v| {
            r.norm_energy = v;
        });
        normalize_into(&mut out, indices, |r| r.quality_raw, Direction::HigherBetter, |r, v| {
            r.norm_quality = v;
        });
    }

    for row in &mut out {
        row.efficiency_score =
            W_THROUGHPUT * row.norm_tps + W_LATENCY * row.norm_lat + W_ENERGY * row.norm_energy;
        row.qe_ratio = (row.norm_quality + 0.01) / (1.01 - row.efficiency_score);
    }
    out
}

fn normalize_into(
    rows: &mut [AnalysisRow],
    indices: &[usize],
    get: impl Fn(&AnalysisRow) -> f64,
    direction: Direction,
    set: impl Fn(&mut AnalysisRow, f64),
) {
    let values: Vec<f64> = indices.iter().map(|&i| get(&rows[i])).collect();
    let normalized = stats::min_max_normalize(&values, direction);
    for (&i, v) in indices.iter().zip(normalized) {
        set(&mut rows[i], v);
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Read `summary/results.csv` from an experiment directory.
pub fn load_rows(exp_dir: &Path) -> Result<Vec<SummaryRow>> {
    let path = exp_dir.join("summary").join("results.csv");
    if !path.exists() {
        return Err(MedirError::Analysis(format!(
            "results not found: {}",
            path.display()
        )));
    }
    let mut reader = csv::Reader::from_path(&path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

fn load_stats(exp_dir: &Path) -> Vec<GroupStats> {
    let path = exp_dir.join("summary").join("stats.csv");
    let Ok(mut reader) = csv::Reader::from_path(&path) else {
        return Vec::new();
    };
    reader.deserialize().filter_map(std::result::Result::ok).collect()
}

/// Unified quality per run, recovered from the raw record files.
/// Unreadable records are skipped with a warning.
#[must_use]
pub fn load_unified_quality(exp_dir: &Path) -> HashMap<RunKey, f64> {
    let mut unified = HashMap::new();
    let raw_dir = exp_dir.join("raw");
    let Ok(model_dirs) = fs::read_dir(&raw_dir) else {
        return unified;
    };
    for model_dir in model_dirs.flatten() {
        let Ok(files) = fs::read_dir(model_dir.path()) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: RunRecord = match fs::read_to_string(&path)
                .map_err(MedirError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(MedirError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping unreadable record {}: {e}", path.display());
                    continue;
                }
            };
            if let Some(score) = record.quality.unified() {
                let key = (
                    record.spec.model.clone(),
                    record.spec.task,
                    record.spec.load,
                    record.spec.run,
                );
                unified.insert(key, score);
            }
        }
    }
    unified
}

// ============================================================================
// Report
// ============================================================================

fn mean_by_model(rows: &[AnalysisRow], get: impl Fn(&AnalysisRow) -> f64) -> Vec<(String, f64)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<f64>> = HashMap::new();
    for row in rows {
        if !groups.contains_key(&row.model) {
            order.push(row.model.clone());
        }
        groups.entry(row.model.clone()).or_default().push(get(row));
    }
    order
        .into_iter()
        .map(|model| {
            let mean = stats::mean(&groups[&model]);
            (model, mean)
        })
        .collect()
}

fn ascii_bar(value: f64, max: f64, width: usize) -> String {
    if max <= 0.0 {
        return String::new();
    }
    let filled = ((value / max) * width as f64).round().max(0.0) as usize;
    "#".repeat(filled.min(width))
}

/// Render the Markdown analysis report.
#[must_use]
pub fn render_report(rows: &[AnalysisRow], group_stats: &[GroupStats], exp_dir: &Path) -> String {
    let mut report = String::new();
    let models: Vec<String> = {
        let mut seen = Vec::new();
        for r in rows {
            if !seen.contains(&r.model) {
                seen.push(r.model.clone());
            }
        }
        seen
    };
    let tasks: Vec<&str> = {
        let mut seen = Vec::new();
        for r in rows {
            if !seen.contains(&r.task.name()) {
                seen.push(r.task.name());
            }
        }
        seen
    };

    report.push_str("# Experiment Analysis Report\n\n");
    report.push_str("## 1. Overview\n\n");
    report.push_str(&format!("- **Experiment**: `{}`\n", exp_dir.display()));
    report.push_str(&format!(
        "- **Generated**: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    report.push_str(&format!("- **Models**: {}\n", models.join(", ")));
    report.push_str(&format!("- **Tasks**: {}\n", tasks.join(", ")));
    report.push_str(&format!("- **Samples**: {}\n\n", rows.len()));

    let mut qe_ranking = mean_by_model(rows, |r| r.qe_ratio);
    qe_ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let tps_ranking = mean_by_model(rows, |r| r.toks_per_s);
    let energy_ranking = mean_by_model(rows, |r| r.gpu_energy_j);

    report.push_str("## 2. Key findings\n\n");
    if let Some((model, qe)) = qe_ranking.first() {
        report.push_str(&format!(
            "- **Best quality-to-cost ratio**: **{model}** ({qe:.4})\n"
        ));
    }
    if let Some((model, tps)) = tps_ranking
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        report.push_str(&format!(
            "- **Highest throughput**: **{model}** ({tps:.2} tokens/s)\n"
        ));
    }
    if let Some((model, energy)) = energy_ranking
        .iter()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        report.push_str(&format!(
            "- **Lowest energy per run**: **{model}** ({energy:.2} J)\n"
        ));
    }
    report.push('\n');

    let tps: Vec<f64> = rows.iter().map(|r| r.toks_per_s).collect();
    let energy: Vec<f64> = rows.iter().map(|r| r.gpu_energy_j).collect();
    let quality: Vec<f64> = rows
        .iter()
        .filter(|r| r.quality_raw != 0.0)
        .map(|r| r.quality_raw)
        .collect();
    report.push_str("## 3. Dimension detail\n\n");
    report.push_str("### 3.1 Efficiency\n\n");
    report.push_str(&format!(
        "- Throughput mean {:.2} tokens/s, peak {:.2} tokens/s\n",
        stats::mean(&tps),
        stats::min_max(&tps).map_or(0.0, |(_, hi)| hi)
    ));
    report.push_str(&format!(
        "- GPU energy mean per run: {:.2} J\n\n",
        stats::mean(&energy)
    ));
    report.push_str("### 3.2 Quality\n\n");
    if quality.is_empty() {
        report.push_str("- No quality scores available\n\n");
    } else {
        report.push_str(&format!(
            "- Unified quality mean {:.4}, best {:.4}\n\n",
            stats::mean(&quality),
            stats::min_max(&quality).map_or(0.0, |(_, hi)| hi)
        ));
    }

    report.push_str("### 3.3 Quality-to-cost ranking\n\n");
    report.push_str("```text\n");
    let max_qe = qe_ranking.first().map_or(0.0, |(_, v)| *v);
    let name_width = qe_ranking.iter().map(|(m, _)| m.len()).max().unwrap_or(0);
    for (model, qe) in &qe_ranking {
        report.push_str(&format!(
            "{model:<name_width$}  {qe:>8.4}  {}\n",
            ascii_bar(*qe, max_qe, 40)
        ));
    }
    report.push_str("```\n\n");

    if !group_stats.is_empty() {
        report.push_str("## 4. Group summary\n\n");
        report.push_str(
            "| model | task | load | n | latency mean (s) | tps mean | energy mean (J) | quality mean |\n",
        );
        report.push_str("|---|---|---|---|---|---|---|---|\n");
        for g in group_stats {
            report.push_str(&format!(
                "| {} | {} | {} | {} | {:.3} | {:.2} | {:.2} | {} |\n",
                g.model,
                g.task,
                g.load,
                g.count,
                g.latency_mean,
                g.tps_mean,
                g.energy_j_mean,
                g.bartscore_mean
                    .map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
            ));
        }
        report.push('\n');
    }
    report
}

// ============================================================================
// Driver
// ============================================================================

/// Analyzer invocation parameters.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub exp_dir: PathBuf,
    /// Where to write the analysis outputs (`<exp_dir>/analysis` when
    /// unset)
    pub results_dir: Option<PathBuf>,
}

/// Run the full offline analysis. Returns the report path.
pub fn run_analysis(opts: &AnalyzeOptions) -> Result<PathBuf> {
    let rows = load_rows(&opts.exp_dir)?;
    if rows.is_empty() {
        return Err(MedirError::Analysis("no rows to analyze".to_string()));
    }
    let unified = load_unified_quality(&opts.exp_dir);
    let analysis = build_analysis(&rows, &unified);
    let group_stats = load_stats(&opts.exp_dir);

    let results_dir = opts
        .results_dir
        .clone()
        .unwrap_or_else(|| opts.exp_dir.join("analysis"));
    fs::create_dir_all(&results_dir)?;

    let data_path = results_dir.join("analysis_data.csv");
    let mut writer = csv::Writer::from_path(&data_path)?;
    for row in &analysis {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("analysis data written: {}", data_path.display());

    let report_path = results_dir.join("report.md");
    fs::write(
        &report_path,
        render_report(&analysis, &group_stats, &opts.exp_dir),
    )?;

    let mv_path = results_dir.join("multivariate_report.md");
    fs::write(&mv_path, multivariate::render_report(&analysis))?;
    info!("multivariate report written: {}", mv_path.display());

    println!("report written: {}", report_path.display());
    println!("multivariate report written: {}", mv_path.display());
    Ok(report_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(model: &str, task: TaskKind, run: u32, lat: f64, tps: f64, energy: f64, bart: Option<f64>) -> SummaryRow {
        SummaryRow {
            timestamp: String::new(),
            model: model.to_string(),
            task,
            load: LoadTier::Short,
            run,
            latency_s: lat,
            toks_per_s: Some(tps),
            gpu_mem_peak_mb: 4000.0,
            gpu_util_avg: 50.0,
            gpu_energy_j: energy,
            bartscore: bart,
        }
    }

    #[test]
    fn test_degenerate_task_group_normalizes_to_one() {
        let rows = vec![
            row("a", TaskKind::Qa, 1, 2.0, 30.0, 100.0, Some(-3.0)),
            row("b", TaskKind::Qa, 1, 2.0, 30.0, 100.0, Some(-3.0)),
        ];
        let analysis = build_analysis(&rows, &HashMap::new());
        for r in &analysis {
            assert_eq!(r.norm_tps, 1.0);
            assert_eq!(r.norm_quality, 1.0);
            // Inverted columns collapse to 0.0.
            assert_eq!(r.norm_lat, 0.0);
            assert_eq!(r.norm_energy, 0.0);
        }
    }

    #[test]
    fn test_composites() {
        let rows = vec![
            row("fast", TaskKind::Qa, 1, 1.0, 100.0, 50.0, Some(-2.0)),
            row("slow", TaskKind::Qa, 1, 5.0, 20.0, 400.0, Some(-4.0)),
        ];
        let analysis = build_analysis(&rows, &HashMap::new());
        let fast = &analysis[0];
        assert_eq!(fast.norm_tps, 1.0);
        assert_eq!(fast.norm_lat, 1.0);
        assert_eq!(fast.norm_energy, 1.0);
        assert!((fast.efficiency_score - 1.0).abs() < 1e-12);
        // qe = (1 + 0.01) / (1.01 - 1.0)
        assert!((fast.qe_ratio - 101.0).abs() < 1e-9);
        let slow = &analysis[1];
        assert_eq!(slow.efficiency_score, 0.0);
        assert!((slow.qe_ratio - 0.01 / 1.01).abs() < 1e-12);
    }

    #[test]
    fn test_unified_quality_overrides_bartscore() {
        let rows = vec![row("m", TaskKind::Code, 1, 1.0, 10.0, 10.0, None)];
        let mut unified = HashMap::new();
        unified.insert(("m".to_string(), TaskKind::Code, LoadTier::Short, 1), 1.0);
        let analysis = build_analysis(&rows, &unified);
        assert_eq!(analysis[0].quality_raw, 1.0);
    }

    #[test]
    fn test_normalization_is_per_task() {
        let rows = vec![
            row("a", TaskKind::Qa, 1, 1.0, 10.0, 10.0, None),
            row("a", TaskKind::Qa, 2, 2.0, 20.0, 20.0, None),
            // A different task with a much larger scale must not
            // disturb the qa normalization.
            row("a", TaskKind::Code, 1, 100.0, 1000.0, 9999.0, None),
        ];
        let analysis = build_analysis(&rows, &HashMap::new());
        assert_eq!(analysis[0].norm_tps, 0.0);
        assert_eq!(analysis[1].norm_tps, 1.0);
        assert_eq!(analysis[2].norm_tps, 1.0);
    }

    #[test]
    fn test_report_names_best_model() {
        let rows = vec![
            row("winner", TaskKind::Qa, 1, 1.0, 100.0, 50.0, Some(-1.0)),
            row("loser", TaskKind::Qa, 1, 5.0, 20.0, 400.0, Some(-4.0)),
        ];
        let analysis = build_analysis(&rows, &HashMap::new());
        let report = render_report(&analysis, &[], Path::new("/tmp/exp"));
        assert!(report.contains("**winner**"));
        assert!(report.contains("Quality-to-cost ranking"));
    }

    #[test]
    fn test_ascii_bar() {
        assert_eq!(ascii_bar(1.0, 1.0, 10), "##########");
        assert_eq!(ascii_bar(0.5, 1.0, 10), "#####");
        assert_eq!(ascii_bar(0.0, 1.0, 10), "");
        assert_eq!(ascii_bar(1.0, 0.0, 10), "");
    }
}
