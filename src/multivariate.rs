//! Multivariate statistics over the analysis rows: correlation, PCA,
//! MANOVA, hierarchical clustering and canonical correlation.
//!
//! Skewed columns (latency, energy, peak memory) are log1p-transformed
//! and all features are z-scored before decomposition. Every analysis
//! is independent: a singular matrix or an under-sized sample turns
//! that section into a warning in the report and the rest continue.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::analyze::AnalysisRow;
use crate::record::TaskKind;
use crate::stats;

/// Feature columns, in matrix order.
pub const FEATURES: [&str; 6] = [
    "latency_s",
    "toks_per_s",
    "gpu_mem_peak_mb",
    "gpu_util_avg",
    "gpu_energy_j",
    "final_quality",
];

/// Columns log1p-transformed before scaling (indices into [`FEATURES`]).
const LOG_COLUMNS: [usize; 3] = [0, 2, 4];

/// Cumulative explained-variance target for component selection.
const PCA_VARIANCE_TARGET: f64 = 0.8;

/// Dependent variables for the MANOVA (indices into [`FEATURES`]).
const MANOVA_COLUMNS: [usize; 4] = [0, 1, 4, 5];

/// Resource variables for the CCA (indices into [`FEATURES`]).
const CCA_X: [usize; 3] = [2, 4, 3];
/// Performance variables for the CCA (indices into [`FEATURES`]).
const CCA_Y: [usize; 3] = [1, 0, 5];

const EIGEN_FLOOR: f64 = 1e-10;

// ============================================================================
// Matrix construction
// ============================================================================

fn feature_value(row: &AnalysisRow, index: usize) -> f64 {
    match index {
        0 => row.latency_s,
        1 => row.toks_per_s,
        2 => row.gpu_mem_peak_mb,
        3 => row.gpu_util_avg,
        4 => row.gpu_energy_j,
        _ => row.quality_raw,
    }
}

/// Raw feature matrix, one row per run.
#[must_use]
pub fn feature_matrix(rows: &[AnalysisRow]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), FEATURES.len(), |r, c| feature_value(&rows[r], c))
}

/// log1p on the skewed columns, then z-score every column. Columns
/// with zero spread become all-zero.
#[must_use]
pub fn transformed_matrix(rows: &[AnalysisRow]) -> DMatrix<f64> {
    let mut m = feature_matrix(rows);
    for &c in &LOG_COLUMNS {
        for r in 0..m.nrows() {
            m[(r, c)] = m[(r, c)].max(0.0).ln_1p();
        }
    }
    zscore(&m)
}

fn zscore(m: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = m.clone();
    for c in 0..m.ncols() {
        let column: Vec<f64> = m.column(c).iter().copied().collect();
        let mean = stats::mean(&column);
        let std = stats::std_dev(&column);
        for r in 0..m.nrows() {
            out[(r, c)] = if std > 0.0 { (m[(r, c)] - mean) / std } else { 0.0 };
        }
    }
    out
}

/// Sample covariance of already-centered data.
fn covariance(centered: &DMatrix<f64>) -> DMatrix<f64> {
    let n = centered.nrows().max(2) as f64;
    (centered.transpose() * centered) / (n - 1.0)
}

// ============================================================================
// Correlation
// ============================================================================

/// Pairwise Pearson correlations over the raw feature columns.
/// Degenerate pairs yield 0.0 off-diagonal.
#[must_use]
pub fn correlation_matrix(rows: &[AnalysisRow]) -> DMatrix<f64> {
    let m = feature_matrix(rows);
    let k = FEATURES.len();
    let columns: Vec<Vec<f64>> = (0..k)
        .map(|c| m.column(c).iter().copied().collect())
        .collect();
    DMatrix::from_fn(k, k, |i, j| {
        if i == j {
            1.0
        } else {
            stats::pearson(&columns[i], &columns[j]).unwrap_or(0.0)
        }
    })
}

fn correlation_section(rows: &[AnalysisRow]) -> Result<String, String> {
    if rows.len() < 2 {
        return Err("fewer than two samples".to_string());
    }
    let corr = correlation_matrix(rows);
    let mut out = String::new();
    out.push_str("| |");
    for name in FEATURES {
        out.push_str(&format!(" {name} |"));
    }
    out.push('\n');
    out.push_str(&format!("|---|{}\n", "---|".repeat(FEATURES.len())));
    for (i, name) in FEATURES.iter().enumerate() {
        out.push_str(&format!("| **{name}** |"));
        for j in 0..FEATURES.len() {
            out.push_str(&format!(" {:.2} |", corr[(i, j)]));
        }
        out.push('\n');
    }
    Ok(out)
}

// ============================================================================
// PCA
// ============================================================================

/// Principal component decomposition result.
#[derive(Debug, Clone)]
pub struct Pca {
    /// Per-component share of total variance, descending
    pub explained_variance_ratio: Vec<f64>,
    /// Loadings, features x retained components
    pub components: DMatrix<f64>,
    /// Components retained to reach the variance target
    pub n_components: usize,
}

/// PCA via the eigendecomposition of the covariance matrix, retaining
/// components up to `target` cumulative explained variance.
pub fn pca(x: &DMatrix<f64>, target: f64) -> Result<Pca, String> {
    if x.nrows() < 2 {
        return Err("fewer than two samples".to_string());
    }
    let cov = covariance(x);
    let eigen = SymmetricEigen::new(cov);
    let total: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
    if total <= 0.0 {
        return Err("no variance in the feature matrix".to_string());
    }
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let ratios: Vec<f64> = order
        .iter()
        .map(|&i| eigen.eigenvalues[i].max(0.0) / total)
        .collect();
    let mut cumulative = 0.0;
    let mut n_components = ratios.len();
    for (k, r) in ratios.iter().enumerate() {
        cumulative += r;
        if cumulative >= target {
            n_components = k + 1;
            break;
        }
    }
    let components = DMatrix::from_fn(x.ncols(), n_components, |feature, k| {
        eigen.eigenvectors[(feature, order[k])]
    });
    Ok(Pca {
        explained_variance_ratio: ratios,
        components,
        n_components,
    })
}

fn pca_section(x: &DMatrix<f64>) -> Result<String, String> {
    let decomposition = pca(x, PCA_VARIANCE_TARGET)?;
    let mut out = String::new();
    let retained: f64 = decomposition
        .explained_variance_ratio
        .iter()
        .take(decomposition.n_components)
        .sum();
    for (i, r) in decomposition
        .explained_variance_ratio
        .iter()
        .take(decomposition.n_components)
        .enumerate()
    {
        out.push_str(&format!("- **PC{} explained variance**: {:.2}%\n", i + 1, r * 100.0));
    }
    out.push_str(&format!(
        "- **Cumulative ({} components)**: {:.2}%\n\n",
        decomposition.n_components,
        retained * 100.0
    ));
    out.push_str("### Factor loadings\n\n| feature |");
    for k in 0..decomposition.n_components {
        out.push_str(&format!(" PC{} |", k + 1));
    }
    out.push('\n');
    out.push_str(&format!("|---|{}\n", "---|".repeat(decomposition.n_components)));
    for (f, name) in FEATURES.iter().enumerate() {
        out.push_str(&format!("| {name} |"));
        for k in 0..decomposition.n_components {
            out.push_str(&format!(" {:.3} |", decomposition.components[(f, k)]));
        }
        out.push('\n');
    }
    Ok(out)
}

// ============================================================================
// MANOVA
// ============================================================================

/// Wilks' lambda test result for one factor.
#[derive(Debug, Clone)]
pub struct ManovaResult {
    pub factor: &'static str,
    pub wilks_lambda: f64,
    pub f_approx: f64,
    pub df1: f64,
    pub df2: f64,
    pub groups: usize,
}

/// One-way MANOVA over `labels` via Wilks' lambda and Rao's F
/// approximation.
pub fn manova(x: &DMatrix<f64>, labels: &[String], factor: &'static str) -> Result<ManovaResult, String> {
    let n = x.nrows();
    if n != labels.len() {
        return Err("label/sample mismatch".to_string());
    }
    let p = x.ncols();
    let mut groups: Vec<(&String, Vec<usize>)> = Vec::new();
    for (i, label) in labels.iter().enumerate() {
        match groups.iter_mut().find(|(l, _)| *l == label) {
            Some((_, members)) => members.push(i),
            None => groups.push((label, vec![i])),
        }
    }
    let g = groups.len();
    if g < 2 {
        return Err("factor has a single level".to_string());
    }
    if n <= p + g {
        return Err(format!("too few samples ({n}) for {p} variables and {g} groups"));
    }

    let grand_mean = DVector::from_fn(p, |c, _| x.column(c).sum() / n as f64);
    let mut within = DMatrix::zeros(p, p);
    let mut between = DMatrix::zeros(p, p);
    for (_, members) in &groups {
        let size = members.len() as f64;
        let group_mean = DVector::from_fn(p, |c, _| {
            members.iter().map(|&r| x[(r, c)]).sum::<f64>() / size
        });
        for &r in members {
            let dev = DVector::from_fn(p, |c, _| x[(r, c)] - group_mean[c]);
            within += &dev * dev.transpose();
        }
        let dev = &group_mean - &grand_mean;
        between += size * &dev * dev.transpose();
    }

    let det_w = within.determinant();
    let det_t = (&within + &between).determinant();
    if det_w <= 0.0 || det_t <= 0.0 {
        return Err("singular scatter matrix".to_string());
    }
    let lambda = (det_w / det_t).clamp(f64::MIN_POSITIVE, 1.0);

    // Rao's F approximation for Wilks' lambda.
    let p_f = p as f64;
    let q = (g - 1) as f64;
    let denom = p_f * p_f + q * q - 5.0;
    let s = if denom > 0.0 {
        ((p_f * p_f * q * q - 4.0) / denom).sqrt()
    } else {
        1.0
    };
    let m = n as f64 - 1.0 - (p_f + g as f64) / 2.0;
    let df1 = p_f * q;
    let df2 = m * s - df1 / 2.0 + 1.0;
    if df2 <= 0.0 {
        return Err("non-positive denominator degrees of freedom".to_string());
    }
    let root = lambda.powf(1.0 / s);
    let f_approx = ((1.0 - root) / root) * (df2 / df1);
    Ok(ManovaResult {
        factor,
        wilks_lambda: lambda,
        f_approx,
        df1,
        df2,
        groups: g,
    })
}

fn manova_section(x: &DMatrix<f64>, rows: &[AnalysisRow]) -> String {
    let deps = DMatrix::from_fn(x.nrows(), MANOVA_COLUMNS.len(), |r, k| {
        x[(r, MANOVA_COLUMNS[k])]
    });
    let mut out = String::new();
    out.push_str("| factor | levels | Wilks' lambda | F approx | df1 | df2 |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    let model_labels: Vec<String> = rows.iter().map(|r| r.model.clone()).collect();
    let task_labels: Vec<String> = rows.iter().map(|r| r.task.name().to_string()).collect();
    for (labels, factor) in [(model_labels, "model"), (task_labels, "task")] {
        match manova(&deps, &labels, factor) {
            Ok(result) => out.push_str(&format!(
                "| {} | {} | {:.4} | {:.3} | {:.0} | {:.1} |\n",
                result.factor,
                result.groups,
                result.wilks_lambda,
                result.f_approx,
                result.df1,
                result.df2
            )),
            Err(e) => out.push_str(&format!("| {factor} | - | skipped: {e} | | | |\n")),
        }
    }
    out.push_str("\nA small Wilks' lambda with a large F indicates the factor shifts the joint metric profile.\n");
    out
}

// ============================================================================
// Ward clustering
// ============================================================================

/// One agglomeration step.
#[derive(Debug, Clone)]
pub struct Merge {
    /// Member row indices of the two merged clusters
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    /// Ward distance at the merge
    pub distance: f64,
}

/// Agglomerative clustering with Ward linkage (Lance-Williams
/// recurrence over squared Euclidean distances).
pub fn ward_clustering(x: &DMatrix<f64>) -> Result<Vec<Merge>, String> {
    let n = x.nrows();
    if n < 2 {
        return Err("fewer than two samples".to_string());
    }
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    // Squared distances between current clusters.
    let mut dist: Vec<Vec<f64>> = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d: f64 = (0..x.ncols()).map(|c| (x[(i, c)] - x[(j, c)]).powi(2)).sum();
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }
    let mut active: Vec<usize> = (0..n).collect();
    let mut merges = Vec::new();
    while active.len() > 1 {
        let mut best = (active[0], active[1]);
        let mut best_d = f64::INFINITY;
        for (ai, &i) in active.iter().enumerate() {
            for &j in &active[ai + 1..] {
                if dist[i][j] < best_d {
                    best_d = dist[i][j];
                    best = (i, j);
                }
            }
        }
        let (i, j) = best;
        merges.push(Merge {
            left: clusters[i].clone(),
            right: clusters[j].clone(),
            distance: best_d.max(0.0).sqrt(),
        });
        let ni = clusters[i].len() as f64;
        let nj = clusters[j].len() as f64;
        for &k in &active {
            if k == i || k == j {
                continue;
            }
            let nk = clusters[k].len() as f64;
            let d = ((ni + nk) * dist[i][k] + (nj + nk) * dist[j][k] - nk * dist[i][j])
                / (ni + nj + nk);
            dist[i][k] = d;
            dist[k][i] = d;
        }
        let mut merged = clusters[i].clone();
        merged.extend_from_slice(&clusters[j]);
        clusters[i] = merged;
        active.retain(|&k| k != j);
    }
    Ok(merges)
}

fn clustering_section(x: &DMatrix<f64>, rows: &[AnalysisRow]) -> Result<String, String> {
    let merges = ward_clustering(x)?;
    let label = |members: &[usize]| -> String {
        if members.len() == 1 {
            let r = &rows[members[0]];
            format!("{}-{}#r{}", r.model, r.task.name(), r.run)
        } else {
            format!("cluster({})", members.len())
        }
    };
    let mut out = String::new();
    out.push_str("Ward linkage over the scaled features; merges in order:\n\n```text\n");
    out.push_str(&format!("{:>4}  {:<40}  {:>8}\n", "step", "merge", "height"));
    for (step, merge) in merges.iter().enumerate() {
        out.push_str(&format!(
            "{:>4}  {:<40}  {:>8.3}\n",
            step + 1,
            format!("{} + {}", label(&merge.left), label(&merge.right)),
            merge.distance
        ));
    }
    out.push_str("```\n");
    Ok(out)
}

// ============================================================================
// CCA
// ============================================================================

/// Canonical correlation result.
#[derive(Debug, Clone)]
pub struct Cca {
    /// Canonical correlations, descending
    pub correlations: Vec<f64>,
    /// Correlation of each X variable with the first X variate
    pub x_loadings: Vec<f64>,
    /// Correlation of each Y variable with the first Y variate
    pub y_loadings: Vec<f64>,
}

fn inverse_sqrt(m: &DMatrix<f64>) -> Result<DMatrix<f64>, String> {
    let eigen = SymmetricEigen::new(m.clone());
    if eigen.eigenvalues.iter().any(|&v| v < EIGEN_FLOOR) {
        return Err("covariance matrix is singular".to_string());
    }
    let scaled = DMatrix::from_fn(m.nrows(), m.ncols(), |r, c| {
        eigen.eigenvectors[(r, c)] / eigen.eigenvalues[c].sqrt()
    });
    Ok(&scaled * eigen.eigenvectors.transpose())
}

/// Canonical correlation between two z-scored variable blocks.
pub fn cca(x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<Cca, String> {
    let n = x.nrows();
    if n != y.nrows() {
        return Err("block row mismatch".to_string());
    }
    if n < x.ncols() + y.ncols() + 2 {
        return Err(format!("too few samples ({n}) for canonical analysis"));
    }
    let sxx = covariance(x);
    let syy = covariance(y);
    let sxy = (x.transpose() * y) / (n as f64 - 1.0);
    let sxx_inv_sqrt = inverse_sqrt(&sxx)?;
    let syy_inv_sqrt = inverse_sqrt(&syy)?;
    let m = &sxx_inv_sqrt * sxy * &syy_inv_sqrt;
    let svd = m.clone().svd(true, true);
    let u = svd.u.ok_or("SVD failed")?;
    let v_t = svd.v_t.ok_or("SVD failed")?;
    let correlations: Vec<f64> = svd.singular_values.iter().map(|&s| s.min(1.0)).collect();

    // Directions back in variable space, then loadings as the
    // correlation of each variable with the first canonical variate.
    let a = &sxx_inv_sqrt * u.column(0);
    let b = &syy_inv_sqrt * v_t.row(0).transpose();
    let x_variate: Vec<f64> = (0..n).map(|r| x.row(r).transpose().dot(&a)).collect();
    let y_variate: Vec<f64> = (0..n).map(|r| y.row(r).transpose().dot(&b)).collect();
    let x_loadings = (0..x.ncols())
        .map(|c| {
            let column: Vec<f64> = x.column(c).iter().copied().collect();
            stats::pearson(&column, &x_variate).unwrap_or(0.0)
        })
        .collect();
    let y_loadings = (0..y.ncols())
        .map(|c| {
            let column: Vec<f64> = y.column(c).iter().copied().collect();
            stats::pearson(&column, &y_variate).unwrap_or(0.0)
        })
        .collect();
    Ok(Cca {
        correlations,
        x_loadings,
        y_loadings,
    })
}

fn cca_section(x: &DMatrix<f64>) -> Result<String, String> {
    let resources = DMatrix::from_fn(x.nrows(), CCA_X.len(), |r, k| x[(r, CCA_X[k])]);
    let performance = DMatrix::from_fn(x.nrows(), CCA_Y.len(), |r, k| x[(r, CCA_Y[k])]);
    let result = cca(&resources, &performance)?;
    let mut out = String::new();
    out.push_str(
        "Relates resource consumption (peak memory, energy, utilization) to performance output (throughput, latency, quality).\n\n",
    );
    for (i, r) in result.correlations.iter().enumerate() {
        out.push_str(&format!("- **Pair {}**: {:.4}\n", i + 1, r));
    }
    out.push_str("\n### Loadings on the first pair\n\n| variable | block | loading |\n|---|---|---|\n");
    for (k, &c) in CCA_X.iter().enumerate() {
        out.push_str(&format!(
            "| {} | resource | {:.3} |\n",
            FEATURES[c], result.x_loadings[k]
        ));
    }
    for (k, &c) in CCA_Y.iter().enumerate() {
        out.push_str(&format!(
            "| {} | performance | {:.3} |\n",
            FEATURES[c], result.y_loadings[k]
        ));
    }
    Ok(out)
}

// ============================================================================
// Report
// ============================================================================

/// Render the full multivariate report. Individual section failures
/// become inline warnings.
#[must_use]
pub fn render_report(rows: &[AnalysisRow]) -> String {
    let mut report = String::new();
    report.push_str("# Multivariate Statistical Analysis\n\n");
    report.push_str(&format!("- **Samples**: {}\n\n", rows.len()));

    let mut section = |title: &str, body: Result<String, String>, report: &mut String| {
        report.push_str(&format!("## {title}\n\n"));
        match body {
            Ok(text) => report.push_str(&text),
            Err(warning) => report.push_str(&format!("> **Warning**: skipped, {warning}\n")),
        }
        report.push('\n');
    };

    section(
        "1. Correlation",
        correlation_section(rows),
        &mut report,
    );
    if rows.len() < 2 {
        for title in ["2. MANOVA", "3. PCA", "4. Hierarchical clustering", "5. Canonical correlation"] {
            section(title, Err("fewer than two samples".to_string()), &mut report);
        }
        return report;
    }
    let x = transformed_matrix(rows);
    report.push_str("## 2. MANOVA\n\n");
    report.push_str(&manova_section(&x, rows));
    report.push('\n');
    section("3. PCA", pca_section(&x), &mut report);
    section(
        "4. Hierarchical clustering",
        clustering_section(&x, rows),
        &mut report,
    );
    section("5. Canonical correlation", cca_section(&x), &mut report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LoadTier;

    fn row(model: &str, task: TaskKind, run: u32, lat: f64, tps: f64, energy: f64, quality: f64) -> AnalysisRow {
        AnalysisRow {
            model: model.to_string(),
            task,
            load: LoadTier::Short,
            run,
            latency_s: lat,
            toks_per_s: tps,
            gpu_mem_peak_mb: 2000.0 + tps * 10.0,
            gpu_util_avg: 40.0 + tps / 2.0,
            gpu_energy_j: energy,
            quality_raw: quality,
            norm_tps: 0.0,
            norm_lat: 0.0,
            norm_energy: 0.0,
            norm_quality: 0.0,
            efficiency_score: 0.0,
            qe_ratio: 0.0,
        }
    }

    fn sample_rows() -> Vec<AnalysisRow> {
        let mut rows = Vec::new();
        for run in 1..=6 {
            let r = f64::from(run);
            rows.push(row("fast", TaskKind::Qa, run, 1.0 + 0.1 * r, 90.0 + r, 100.0 + 3.0 * r, -2.0 + 0.05 * r));
            rows.push(row("slow", TaskKind::Qa, run, 4.0 + 0.2 * r, 30.0 + 2.0 * r, 400.0 + 5.0 * r, -3.0 - 0.04 * r));
            rows.push(row("fast", TaskKind::Code, run, 2.0 + 0.1 * r, 80.0 - r, 150.0 + 4.0 * r, 1.0 - 0.02 * r));
            rows.push(row("slow", TaskKind::Code, run, 5.0 + 0.3 * r, 25.0 + r, 450.0 + 6.0 * r, 0.5 + 0.03 * r));
        }
        rows
    }

    #[test]
    fn test_zscore_columns_are_standardized() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        for c in 0..x.ncols() {
            let column: Vec<f64> = x.column(c).iter().copied().collect();
            assert!(stats::mean(&column).abs() < 1e-9);
            let std = stats::std_dev(&column);
            assert!(std == 0.0 || (std - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_correlation_matrix_diagonal_and_symmetry() {
        let rows = sample_rows();
        let corr = correlation_matrix(&rows);
        for i in 0..FEATURES.len() {
            assert_eq!(corr[(i, i)], 1.0);
            for j in 0..FEATURES.len() {
                assert!((corr[(i, j)] - corr[(j, i)]).abs() < 1e-12);
                assert!(corr[(i, j)].abs() <= 1.0 + 1e-9);
            }
        }
    }

    #[test]
    fn test_pca_ratios_sum_to_one() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        let decomposition = pca(&x, 0.8).unwrap();
        let total: f64 = decomposition.explained_variance_ratio.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        let retained: f64 = decomposition
            .explained_variance_ratio
            .iter()
            .take(decomposition.n_components)
            .sum();
        assert!(retained >= 0.8);
        // Ratios descend.
        for pair in decomposition.explained_variance_ratio.windows(2) {
            assert!(pair[0] >= pair[1] - 1e-12);
        }
    }

    #[test]
    fn test_pca_rejects_degenerate_input() {
        assert!(pca(&DMatrix::zeros(5, 3), 0.8).is_err());
        assert!(pca(&DMatrix::zeros(1, 3), 0.8).is_err());
    }

    #[test]
    fn test_manova_separated_groups_small_lambda() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        let deps = DMatrix::from_fn(x.nrows(), MANOVA_COLUMNS.len(), |r, k| {
            x[(r, MANOVA_COLUMNS[k])]
        });
        let labels: Vec<String> = rows.iter().map(|r| r.model.clone()).collect();
        let result = manova(&deps, &labels, "model").unwrap();
        assert_eq!(result.groups, 2);
        assert!(result.wilks_lambda > 0.0 && result.wilks_lambda < 1.0);
        // The two models are well separated on every metric.
        assert!(result.wilks_lambda < 0.5);
        assert!(result.f_approx > 0.0);
    }

    #[test]
    fn test_manova_single_level_rejected() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        let labels = vec!["only".to_string(); rows.len()];
        assert!(manova(&x, &labels, "model").is_err());
    }

    #[test]
    fn test_ward_merges_count_and_monotone_start() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        let merges = ward_clustering(&x).unwrap();
        assert_eq!(merges.len(), rows.len() - 1);
        assert!(merges.iter().all(|m| m.distance >= 0.0));
        // The final merge joins everything.
        let last = merges.last().unwrap();
        assert_eq!(last.left.len() + last.right.len(), rows.len());
    }

    #[test]
    fn test_cca_correlations_in_unit_interval() {
        let rows = sample_rows();
        let x = transformed_matrix(&rows);
        let resources = DMatrix::from_fn(x.nrows(), CCA_X.len(), |r, k| x[(r, CCA_X[k])]);
        let performance = DMatrix::from_fn(x.nrows(), CCA_Y.len(), |r, k| x[(r, CCA_Y[k])]);
        let result = cca(&resources, &performance).unwrap();
        assert_eq!(result.correlations.len(), 3);
        for r in &result.correlations {
            assert!((0.0..=1.0).contains(r));
        }
        for pair in result.correlations.windows(2) {
            assert!(pair[0] >= pair[1] - 1e-9);
        }
    }

    #[test]
    fn test_report_degrades_instead_of_failing() {
        // A single row cannot support any decomposition.
        let rows = vec![row("m", TaskKind::Qa, 1, 1.0, 10.0, 100.0, -2.0)];
        let report = render_report(&rows);
        assert!(report.contains("Warning"));
        assert!(report.contains("# Multivariate Statistical Analysis"));
    }

    #[test]
    fn test_full_report_sections_present() {
        let report = render_report(&sample_rows());
        for heading in [
            "## 1. Correlation",
            "## 2. MANOVA",
            "## 3. PCA",
            "## 4. Hierarchical clustering",
            "## 5. Canonical correlation",
        ] {
            assert!(report.contains(heading), "missing {heading}");
        }
    }
}
