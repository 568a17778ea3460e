//! Statistical primitives for robustness scoring.
//!
//! All Sharpe inputs here are per-observation (not annualized). The
//! aggregator converts annualized Sharpe before calling in.
//!
//! - PSR: probability the true Sharpe exceeds a benchmark, adjusted for
//!   sample length, skewness and kurtosis
//! - Expected maximum Sharpe of N independent trials (the DSR benchmark)
//! - MinTRL: observations needed for PSR to reach a target confidence

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use statrs::function::erf::{erfc, erfc_inv};

/// Euler–Mascheroni constant.
pub const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Floor for the PSR variance term. Extreme skew can drive it negative.
const MIN_VARIANCE_TERM: f64 = 1e-4;

// ─── Normal distribution ─────────────────────────────────────────────

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile. Returns ±infinity at p = 1 and p = 0.
pub fn normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

// ─── Descriptive ─────────────────────────────────────────────────────

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1). Zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

/// Percentile of pre-sorted values, linear interpolation between ranks.
/// `p` is in [0, 100].
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Median of unsorted values.
pub fn median(values: &[f64]) -> f64 {
    percentile_sorted(&sorted(values), 50.0)
}

// ─── Sharpe inference ────────────────────────────────────────────────

/// Convert an annualized Sharpe to per-observation units.
pub fn deannualize(sharpe: f64, periods_per_year: f64) -> f64 {
    sharpe / periods_per_year.sqrt()
}

fn variance_term(sr: f64, skew: f64, kurtosis: f64) -> f64 {
    (1.0 - skew * sr + ((kurtosis - 1.0) / 4.0) * sr * sr).max(MIN_VARIANCE_TERM)
}

/// Probabilistic Sharpe Ratio.
///
/// `kurtosis` is Pearson (normal = 3). Fewer than two observations give 0.
pub fn probabilistic_sharpe(sr: f64, benchmark: f64, n: usize, skew: f64, kurtosis: f64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let z = (sr - benchmark) * ((n - 1) as f64).sqrt() / variance_term(sr, skew, kurtosis).sqrt();
    normal_cdf(z)
}

/// Expected maximum Sharpe among `n_trials` independent trials with
/// cross-trial Sharpe standard deviation `sigma`. This is the DSR benchmark.
pub fn expected_max_sharpe(sigma: f64, n_trials: usize) -> f64 {
    if n_trials < 2 || !(sigma > 0.0) {
        return 0.0;
    }
    let n = n_trials as f64;
    sigma
        * ((1.0 - EULER_GAMMA) * normal_quantile(1.0 - 1.0 / n)
            + EULER_GAMMA * normal_quantile(1.0 - 1.0 / (n * std::f64::consts::E)))
}

/// Minimum track record length for PSR to reach `confidence`.
///
/// `None` when `sr <= benchmark`: no finite sample suffices.
pub fn min_track_record_length(
    sr: f64,
    benchmark: f64,
    skew: f64,
    kurtosis: f64,
    confidence: f64,
) -> Option<u64> {
    if sr <= benchmark {
        return None;
    }
    let ratio = normal_quantile(confidence) / (sr - benchmark);
    let n = 1.0 + variance_term(sr, skew, kurtosis) * ratio * ratio;
    if !n.is_finite() {
        return None;
    }
    Some(n.ceil().max(1.0) as u64)
}

// ─── Sample adequacy ─────────────────────────────────────────────────

/// Grade of the sample size behind a Sharpe estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adequacy {
    Insufficient,
    Weak,
    Marginal,
    Good,
    Excellent,
}

impl Adequacy {
    pub fn from_samples(n: usize) -> Self {
        match n {
            n if n >= 1000 => Adequacy::Excellent,
            n if n >= 100 => Adequacy::Good,
            n if n >= 50 => Adequacy::Marginal,
            n if n >= 30 => Adequacy::Weak,
            _ => Adequacy::Insufficient,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Adequacy::Insufficient => "insufficient",
            Adequacy::Weak => "weak",
            Adequacy::Marginal => "marginal",
            Adequacy::Good => "good",
            Adequacy::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for Adequacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
