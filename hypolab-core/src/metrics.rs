//! Performance metrics and parameter sets.
//!
//! Metrics are produced by the external Backtest Executor and are immutable
//! once created. Gate evaluators reject malformed values (NaN Sharpe,
//! drawdown outside [0, 1], ...) instead of silently deciding on them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Strategy parameters by name. Ordered so serialized snapshots are stable.
pub type ParameterSet = BTreeMap<String, f64>;

/// Performance metrics for a single backtest over one date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Annualized Sharpe ratio.
    pub sharpe_ratio: f64,
    /// Maximum drawdown as a positive fraction (0.25 = 25%).
    pub max_drawdown: f64,
    pub total_trades: usize,
    /// Fraction of winning trades in [0, 1].
    pub win_rate: f64,
    pub total_return: f64,
    /// Number of return observations behind the Sharpe estimate.
    pub sample_count: usize,
    #[serde(default)]
    pub skewness: f64,
    /// Pearson (non-excess) kurtosis; a normal distribution has 3.0.
    #[serde(default = "normal_kurtosis")]
    pub kurtosis: f64,
}

fn normal_kurtosis() -> f64 {
    3.0
}

impl PerformanceMetrics {
    /// Metrics with normal-distribution moments (skew 0, kurtosis 3).
    pub fn new(
        sharpe_ratio: f64,
        max_drawdown: f64,
        total_trades: usize,
        win_rate: f64,
        total_return: f64,
        sample_count: usize,
    ) -> Self {
        Self {
            sharpe_ratio,
            max_drawdown,
            total_trades,
            win_rate,
            total_return,
            sample_count,
            skewness: 0.0,
            kurtosis: normal_kurtosis(),
        }
    }

    /// Builder-style override of the return-distribution moments.
    pub fn with_moments(mut self, skewness: f64, kurtosis: f64) -> Self {
        self.skewness = skewness;
        self.kurtosis = kurtosis;
        self
    }

    /// First malformed field, if any, as `(field, value)`.
    pub fn malformed_field(&self) -> Option<(&'static str, f64)> {
        if !self.sharpe_ratio.is_finite() {
            return Some(("sharpe_ratio", self.sharpe_ratio));
        }
        if !(0.0..=1.0).contains(&self.max_drawdown) {
            return Some(("max_drawdown", self.max_drawdown));
        }
        if !(0.0..=1.0).contains(&self.win_rate) {
            return Some(("win_rate", self.win_rate));
        }
        if !self.total_return.is_finite() {
            return Some(("total_return", self.total_return));
        }
        if !self.skewness.is_finite() {
            return Some(("skewness", self.skewness));
        }
        if !self.kurtosis.is_finite() || self.kurtosis < 0.0 {
            return Some(("kurtosis", self.kurtosis));
        }
        None
    }
}

/// One evaluated point of a parameter search, as reported by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCandidate {
    pub parameters: ParameterSet,
    pub sharpe_ratio: f64,
}
