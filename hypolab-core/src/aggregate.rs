//! Robustness aggregation over a set of Monte Carlo walk-forward runs.
//!
//! Takes the completed runs of one validation pass and produces a
//! [`RobustnessSummary`]:
//! - Percentile distributions of test Sharpe, degradation and per-run PSR
//! - Pooled PSR, deflated Sharpe (DSR) and minimum track record length
//! - Overfitting indicators (CV, walk-forward efficiency, consistency)
//! - Generalization fractions and parameter consensus across runs
//!
//! Percentiles are the primary reporting unit; Sharpe and degradation
//! distributions are usually skewed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{ParameterSet, PerformanceMetrics};
use crate::split::DateSplit;
use crate::stats::{self, Adequacy};
use crate::thresholds::ThresholdConfig;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregateError {
    #[error("cannot aggregate an empty run set")]
    EmptyRunSet,
}

// ─── Runs ────────────────────────────────────────────────────────────

/// One completed walk-forward iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloRun {
    pub run_index: usize,
    pub split: DateSplit,
    /// Parameters chosen on the train window and applied to the test window.
    pub parameters: ParameterSet,
    pub train_metrics: PerformanceMetrics,
    pub test_metrics: PerformanceMetrics,
    pub degradation: f64,
}

impl MonteCarloRun {
    pub fn new(
        run_index: usize,
        split: DateSplit,
        parameters: ParameterSet,
        train_metrics: PerformanceMetrics,
        test_metrics: PerformanceMetrics,
    ) -> Self {
        let degradation = degradation(train_metrics.sharpe_ratio, test_metrics.sharpe_ratio);
        Self {
            run_index,
            split,
            parameters,
            train_metrics,
            test_metrics,
            degradation,
        }
    }
}

/// Relative train-to-test Sharpe drop. Zero when the train Sharpe is not positive.
pub fn degradation(train_sharpe: f64, test_sharpe: f64) -> f64 {
    if train_sharpe > 0.0 {
        (train_sharpe - test_sharpe) / train_sharpe
    } else {
        0.0
    }
}

// ─── Summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl Percentiles {
    pub fn from_values(values: &[f64]) -> Self {
        let s = stats::sorted(values);
        Self {
            p10: stats::percentile_sorted(&s, 10.0),
            p25: stats::percentile_sorted(&s, 25.0),
            p50: stats::percentile_sorted(&s, 50.0),
            p75: stats::percentile_sorted(&s, 75.0),
            p90: stats::percentile_sorted(&s, 90.0),
        }
    }
}

/// Warnings raised while aggregating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustnessFlag {
    /// Test Sharpe coefficient of variation at or above the stable band.
    UnstableSharpe,
    /// Out-of-sample Sharpe matches or beats in-sample. Verify the setup.
    VerifyEfficiency,
    /// Too few runs with positive test Sharpe.
    Inconsistent,
    /// Some run traded less than the per-run floor.
    InsufficientTrades,
    /// Some parameter lacks consensus across runs.
    UnstableParameters,
    /// Pooled Sharpe does not beat the benchmark; MinTRL is unbounded.
    UnboundedTrackRecord,
}

impl std::fmt::Display for RobustnessFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RobustnessFlag::UnstableSharpe => "test Sharpe unstable across runs",
            RobustnessFlag::VerifyEfficiency => "verify: unexpectedly high OOS performance",
            RobustnessFlag::Inconsistent => "inconsistent: too few positive test runs",
            RobustnessFlag::InsufficientTrades => "insufficient trades in some runs",
            RobustnessFlag::UnstableParameters => "no parameter consensus",
            RobustnessFlag::UnboundedTrackRecord => "Sharpe does not beat benchmark",
        };
        f.write_str(s)
    }
}

/// Consensus for a single parameter across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConsensus {
    /// Most frequently chosen value.
    pub value: f64,
    /// Fraction of runs that chose `value`.
    pub consensus: f64,
    pub stable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStability {
    /// Mean consensus over all parameters; 1.0 when no parameters vary.
    pub score: f64,
    pub per_parameter: BTreeMap<String, ParameterConsensus>,
    /// Most common value of every parameter.
    pub recommended: ParameterSet,
}

/// Aggregated robustness statistics for one validation pass.
///
/// Sharpe-valued fields are annualized, as reported by the executor.
/// PSR, DSR and MinTRL are computed on per-observation Sharpe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessSummary {
    pub runs_used: usize,

    pub test_sharpe: Percentiles,
    pub degradation: Percentiles,
    pub mean_train_sharpe: f64,
    pub mean_test_sharpe: f64,
    pub std_test_sharpe: f64,
    pub mean_degradation: f64,
    pub std_degradation: f64,

    /// PSR of the pooled run set.
    pub psr: f64,
    /// Distribution of per-run PSR.
    pub psr_distribution: Percentiles,
    /// Conservative decision input: 10th percentile of per-run PSR.
    pub psr_p10: f64,
    pub dsr: f64,
    /// Expected maximum Sharpe of `runs_used` trials (annualized).
    pub deflated_benchmark: f64,
    /// Observations needed for PSR to reach the target confidence.
    pub min_track_record: Option<u64>,
    /// Pooled sample count divided by MinTRL.
    pub min_track_record_coverage: Option<f64>,
    pub pooled_sample_count: usize,
    pub adequacy: Adequacy,

    pub coefficient_of_variation: Option<f64>,
    pub walk_forward_efficiency: Option<f64>,
    pub consistency_ratio: f64,
    pub min_trades: usize,
    pub insufficient_trades: bool,

    /// Fraction of runs with degradation above the caution band.
    pub fraction_overfit: f64,
    /// Fraction of runs with degradation below the acceptable band.
    pub fraction_good: f64,

    pub parameter_stability: ParameterStability,
    pub flags: Vec<RobustnessFlag>,
}

impl RobustnessSummary {
    pub fn has_flag(&self, flag: RobustnessFlag) -> bool {
        self.flags.contains(&flag)
    }
}

// ─── Aggregation ─────────────────────────────────────────────────────

/// Aggregate completed runs into a robustness summary.
pub fn aggregate(
    runs: &[MonteCarloRun],
    thresholds: &ThresholdConfig,
) -> Result<RobustnessSummary, AggregateError> {
    if runs.is_empty() {
        return Err(AggregateError::EmptyRunSet);
    }
    let rt = &thresholds.robustness;
    let bands = &thresholds.degradation_thresholds;
    let n = runs.len();
    let scale = rt.annualization_factor;

    let train: Vec<f64> = runs.iter().map(|r| r.train_metrics.sharpe_ratio).collect();
    let test: Vec<f64> = runs.iter().map(|r| r.test_metrics.sharpe_ratio).collect();
    let degradations: Vec<f64> = runs.iter().map(|r| r.degradation).collect();

    let mean_train_sharpe = stats::mean(&train);
    let mean_test_sharpe = stats::mean(&test);
    let std_test_sharpe = stats::std_dev(&test);
    let mean_degradation = stats::mean(&degradations);
    let std_degradation = stats::std_dev(&degradations);

    // Per-run PSR on each test window.
    let benchmark = stats::deannualize(rt.psr_benchmark, scale);
    let per_run_psr: Vec<f64> = runs
        .iter()
        .map(|r| {
            let m = &r.test_metrics;
            stats::probabilistic_sharpe(
                stats::deannualize(m.sharpe_ratio, scale),
                benchmark,
                m.sample_count,
                m.skewness,
                m.kurtosis,
            )
        })
        .collect();
    let psr_distribution = Percentiles::from_values(&per_run_psr);

    // Pooled estimate: mean test Sharpe, median sample length, mean moments.
    let pooled_sr = stats::deannualize(mean_test_sharpe, scale);
    let sample_counts: Vec<f64> = runs.iter().map(|r| r.test_metrics.sample_count as f64).collect();
    let pooled_sample_count = stats::median(&sample_counts).floor() as usize;
    let skew = stats::mean(&runs.iter().map(|r| r.test_metrics.skewness).collect::<Vec<_>>());
    let kurt = stats::mean(&runs.iter().map(|r| r.test_metrics.kurtosis).collect::<Vec<_>>());

    let psr = stats::probabilistic_sharpe(pooled_sr, benchmark, pooled_sample_count, skew, kurt);

    let per_obs_test: Vec<f64> = test.iter().map(|s| stats::deannualize(*s, scale)).collect();
    let sr0 = stats::expected_max_sharpe(stats::std_dev(&per_obs_test), n);
    let dsr = stats::probabilistic_sharpe(pooled_sr, sr0, pooled_sample_count, skew, kurt);

    let min_track_record =
        stats::min_track_record_length(pooled_sr, benchmark, skew, kurt, rt.target_confidence);
    let min_track_record_coverage =
        min_track_record.map(|trl| pooled_sample_count as f64 / trl as f64);

    let coefficient_of_variation = if mean_test_sharpe.abs() > f64::EPSILON {
        Some(std_test_sharpe / mean_test_sharpe.abs())
    } else {
        None
    };
    let walk_forward_efficiency = if mean_train_sharpe.abs() > f64::EPSILON {
        Some(mean_test_sharpe / mean_train_sharpe)
    } else {
        None
    };
    let consistency_ratio = test.iter().filter(|s| **s > 0.0).count() as f64 / n as f64;

    let min_trades = runs
        .iter()
        .map(|r| r.test_metrics.total_trades)
        .min()
        .unwrap_or(0);
    let insufficient_trades = min_trades < rt.min_trades_per_run;

    let fraction_overfit =
        degradations.iter().filter(|d| **d > bands.caution).count() as f64 / n as f64;
    let fraction_good =
        degradations.iter().filter(|d| **d < bands.acceptable).count() as f64 / n as f64;

    let parameter_stability = parameter_stability(runs, rt.parameter_consensus);

    let mut flags = Vec::new();
    if coefficient_of_variation.map_or(true, |cv| cv >= rt.stable_cv) {
        flags.push(RobustnessFlag::UnstableSharpe);
    }
    if walk_forward_efficiency.is_some_and(|wfe| wfe >= rt.efficiency_warning) {
        flags.push(RobustnessFlag::VerifyEfficiency);
    }
    if consistency_ratio < rt.consistent_ratio {
        flags.push(RobustnessFlag::Inconsistent);
    }
    if insufficient_trades {
        flags.push(RobustnessFlag::InsufficientTrades);
    }
    if parameter_stability.per_parameter.values().any(|p| !p.stable) {
        flags.push(RobustnessFlag::UnstableParameters);
    }
    if min_track_record.is_none() {
        flags.push(RobustnessFlag::UnboundedTrackRecord);
    }

    Ok(RobustnessSummary {
        runs_used: n,
        test_sharpe: Percentiles::from_values(&test),
        degradation: Percentiles::from_values(&degradations),
        mean_train_sharpe,
        mean_test_sharpe,
        std_test_sharpe,
        mean_degradation,
        std_degradation,
        psr,
        psr_p10: psr_distribution.p10,
        psr_distribution,
        dsr,
        deflated_benchmark: sr0 * scale.sqrt(),
        min_track_record,
        min_track_record_coverage,
        pooled_sample_count,
        adequacy: Adequacy::from_samples(pooled_sample_count),
        coefficient_of_variation,
        walk_forward_efficiency,
        consistency_ratio,
        min_trades,
        insufficient_trades,
        fraction_overfit,
        fraction_good,
        parameter_stability,
        flags,
    })
}

/// Most common value per parameter and how often it was chosen.
///
/// Ties go to the value seen first in run order.
fn parameter_stability(runs: &[MonteCarloRun], stable_at: f64) -> ParameterStability {
    // name -> [(value, count)] in first-seen order
    let mut counts: BTreeMap<&str, Vec<(f64, usize)>> = BTreeMap::new();
    for run in runs {
        for (name, value) in &run.parameters {
            let entry = counts.entry(name.as_str()).or_default();
            match entry.iter_mut().find(|(v, _)| v.to_bits() == value.to_bits()) {
                Some((_, count)) => *count += 1,
                None => entry.push((*value, 1)),
            }
        }
    }

    let mut per_parameter = BTreeMap::new();
    let mut recommended = ParameterSet::new();
    for (name, values) in counts {
        let mut best = (0.0, 0usize);
        for (value, count) in values {
            if count > best.1 {
                best = (value, count);
            }
        }
        let consensus = best.1 as f64 / runs.len() as f64;
        recommended.insert(name.to_string(), best.0);
        per_parameter.insert(
            name.to_string(),
            ParameterConsensus {
                value: best.0,
                consensus,
                stable: consensus >= stable_at,
            },
        );
    }

    let score = if per_parameter.is_empty() {
        1.0
    } else {
        per_parameter.values().map(|p| p.consensus).sum::<f64>() / per_parameter.len() as f64
    };

    ParameterStability {
        score,
        per_parameter,
        recommended,
    }
}
