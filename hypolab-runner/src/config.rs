//! Run configuration: thresholds, Monte Carlo settings, dataset bounds, costs.
//!
//! Loaded from a single TOML file:
//!
//! ```toml
//! [hypothesis]
//! id = "rsi-mean-reversion"
//!
//! [dataset]
//! start = "2015-01-01"
//! end = "2024-12-31"
//!
//! [monte_carlo]
//! runs_requested = 50
//! min_train_days = 730
//! min_test_days = 180
//!
//! [thresholds.limits]
//! max_cost_budget = 250.0
//! ```

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hypolab_core::{ConfigError, ThresholdConfig};

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum RunConfigError {
    #[error("failed to read run config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse run config")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Thresholds(#[from] ConfigError),

    #[error("invalid run config: {0}")]
    Invalid(String),
}

/// First and last date with data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetBounds {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Monte Carlo walk-forward settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    /// Randomized splits per validation pass (default 50).
    pub runs_requested: usize,
    /// Minimum training window in calendar days (default 730).
    pub min_train_days: u32,
    /// Minimum test window in calendar days (default 180).
    pub min_test_days: u32,
    /// Worker pool size. Sized for external call latency, not CPU count (default 8).
    pub workers: usize,
    /// Master seed for split generation (default 42).
    pub master_seed: u64,
    /// Failed / attempted ratio at or above which the pass is a systematic failure (default 0.5).
    pub max_failure_fraction: f64,
    /// Retry and timeout for each collaborator call.
    pub retry: RetryPolicy,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            runs_requested: 50,
            min_train_days: 730,
            min_test_days: 180,
            workers: 8,
            master_seed: 42,
            max_failure_fraction: 0.5,
            retry: RetryPolicy::default(),
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.runs_requested == 0 {
            return Err(RunConfigError::Invalid("runs_requested must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(RunConfigError::Invalid("workers must be at least 1".into()));
        }
        if !(self.max_failure_fraction > 0.0 && self.max_failure_fraction <= 1.0) {
            return Err(RunConfigError::Invalid(format!(
                "max_failure_fraction {} is outside (0, 1]",
                self.max_failure_fraction
            )));
        }
        Ok(())
    }
}

/// Cost charged against `limits.max_cost_budget` per collaborator call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub per_backtest: f64,
    pub per_optimization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisSection {
    pub id: String,
    #[serde(default)]
    pub strategy_revision: Option<String>,
}

/// Everything needed to drive one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub hypothesis: HypothesisSection,
    pub dataset: DatasetBounds,
    #[serde(default)]
    pub monte_carlo: MonteCarloConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub costs: CostModel,
}

impl RunConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, RunConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RunConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RunConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.dataset.end <= self.dataset.start {
            return Err(RunConfigError::Invalid(format!(
                "dataset end {} is not after start {}",
                self.dataset.end, self.dataset.start
            )));
        }
        self.monte_carlo.validate()?;
        self.thresholds.validate()?;
        if self.monte_carlo.runs_requested > self.thresholds.limits.max_monte_carlo_runs {
            return Err(RunConfigError::Invalid(format!(
                "runs_requested {} exceeds limits.max_monte_carlo_runs {}",
                self.monte_carlo.runs_requested, self.thresholds.limits.max_monte_carlo_runs
            )));
        }
        Ok(())
    }
}
