//! Descriptive-statistics helpers shared by the sweep writer and the
//! offline analyzer.
//!
//! All functions are total over empty input: mean/std of no samples is
//! 0.0, min-max normalization of a degenerate column collapses to a
//! constant. Standard deviation is the population form (divide by n),
//! matching the summary CSV contract.

#![allow(clippy::cast_precision_loss)] // Statistical functions need usize->f64

// ============================================================================
// Scalar aggregates
// ============================================================================

/// Arithmetic mean. Empty input yields 0.0.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divide by n, not n-1).
/// Empty input yields 0.0.
#[must_use]
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Minimum and maximum of a slice, or `None` when empty.
#[must_use]
pub fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in values {
        if v < lo {
            lo = v;
        }
        if v > hi {
            hi = v;
        }
    }
    Some((lo, hi))
}

// ============================================================================
// Normalization
// ============================================================================

/// Direction of a min-max normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Higher raw values map toward 1.0 (throughput, quality).
    HigherBetter,
    /// Lower raw values map toward 1.0 (latency, energy).
    LowerBetter,
}

/// Min-max normalize a column into [0, 1].
///
/// A degenerate column (all values equal, or a single value) collapses
/// to 1.0 under [`Direction::HigherBetter`] and 0.0 under
/// [`Direction::LowerBetter`]: every member is simultaneously best and
/// worst, so composite scores must not reward a group for having no
/// spread.
#[must_use]
pub fn min_max_normalize(values: &[f64], direction: Direction) -> Vec<f64> {
    let Some((lo, hi)) = min_max(values) else {
        return Vec::new();
    };
    let range = hi - lo;
    if range == 0.0 {
        let fill = match direction {
            Direction::HigherBetter => 1.0,
            Direction::LowerBetter => 0.0,
        };
        return vec![fill; values.len()];
    }
    values
        .iter()
        .map(|&v| {
            let n = (v - lo) / range;
            match direction {
                Direction::HigherBetter => n,
                Direction::LowerBetter => 1.0 - n,
            }
        })
        .collect()
}

// ============================================================================
// Percentiles and correlation
// ============================================================================

/// Nearest-rank percentile (`p` in [0, 100]) over a sorted copy.
/// Empty input yields 0.0.
#[must_use]
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Pearson correlation of two equally-long columns.
/// Returns `None` on length mismatch, fewer than two points, or a
/// zero-variance column.
#[must_use]
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        cov += (a - mx) * (b - my);
        vx += (a - mx) * (a - mx);
        vy += (b - my) * (b - my);
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}
