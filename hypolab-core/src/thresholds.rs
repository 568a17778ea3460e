//! Threshold configuration for the three gates.
//!
//! A `ThresholdConfig` is resolved once per hypothesis and treated as
//! read-only afterwards. Per-hypothesis adjustments go through
//! [`ThresholdConfig::apply_overrides`], which returns a new config rather
//! than mutating the one in use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config")]
    Toml(#[from] toml::de::Error),

    #[error("failed to apply overrides")]
    Overrides(#[from] serde_json::Error),

    #[error("invalid threshold {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ─── Sections ────────────────────────────────────────────────────────

/// Floors for one performance tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub min_trades: usize,
}

impl TierThresholds {
    pub fn minimum_viable() -> Self {
        Self {
            sharpe_ratio: 0.5,
            max_drawdown: 0.40,
            min_trades: 30,
        }
    }

    pub fn optimization_worthy() -> Self {
        Self {
            sharpe_ratio: 0.7,
            max_drawdown: 0.35,
            min_trades: 50,
        }
    }

    pub fn production_ready() -> Self {
        Self {
            sharpe_ratio: 1.0,
            max_drawdown: 0.30,
            min_trades: 100,
        }
    }
}

/// Heuristics that make a backtest result untrustworthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverfittingSignals {
    /// Sharpe above this is implausible (default 3.0).
    pub too_perfect_sharpe: f64,
    /// Fewer trades than this cannot support a Sharpe estimate (default 20).
    pub too_few_trades: usize,
    /// Win rate above this is implausible (default 0.75).
    pub win_rate_too_high: f64,
}

impl Default for OverfittingSignals {
    fn default() -> Self {
        Self {
            too_perfect_sharpe: 3.0,
            too_few_trades: 20,
            win_rate_too_high: 0.75,
        }
    }
}

/// In-sample to out-of-sample degradation bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationThresholds {
    pub acceptable: f64,
    pub caution: f64,
    pub abandon: f64,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            acceptable: 0.15,
            caution: 0.30,
            abandon: 0.40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationThresholds {
    /// Relative Sharpe improvement at or above this escalates (default 0.30).
    pub suspicious_improvement: f64,
    /// Relative improvement below this keeps the baseline (default 0.05).
    pub min_improvement: f64,
    /// Normalized top-quartile Sharpe spread that triggers median selection (default 0.5).
    pub sensitivity_spread: f64,
}

impl Default for OptimizationThresholds {
    fn default() -> Self {
        Self {
            suspicious_improvement: 0.30,
            min_improvement: 0.05,
            sensitivity_spread: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationThresholds {
    /// Max std of degradation for DEPLOY (default 0.10).
    pub max_degradation_std: f64,
    /// Min deflated Sharpe ratio for DEPLOY (default 0.95).
    pub min_dsr: f64,
    /// Fraction of runs above the caution band that abandons (default 0.50, strict).
    pub unstable_run_fraction: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_degradation_std: 0.10,
            min_dsr: 0.95,
            unstable_run_fraction: 0.50,
        }
    }
}

/// Parameters of the robustness statistics computed over a run set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustnessThresholds {
    /// Minimum test-window trades per run (default 10).
    pub min_trades_per_run: usize,
    /// Benchmark Sharpe for PSR, annualized (default 0.0).
    pub psr_benchmark: f64,
    /// Target PSR confidence for MinTRL (default 0.95).
    pub target_confidence: f64,
    /// Observations per year; annualized Sharpe is divided by its square root (default 252).
    pub annualization_factor: f64,
    /// Coefficient of variation below this is "stable" (default 0.3).
    pub stable_cv: f64,
    /// Consistency ratio at or above this is "consistent" (default 0.6).
    pub consistent_ratio: f64,
    /// Walk-forward efficiency at or above this is flagged for verification (default 1.0).
    pub efficiency_warning: f64,
    /// Consensus at or above this marks a parameter stable (default 0.70).
    pub parameter_consensus: f64,
}

impl Default for RobustnessThresholds {
    fn default() -> Self {
        Self {
            min_trades_per_run: 10,
            psr_benchmark: 0.0,
            target_confidence: 0.95,
            annualization_factor: 252.0,
            stable_cv: 0.3,
            consistent_ratio: 0.6,
            efficiency_warning: 1.0,
            parameter_consensus: 0.70,
        }
    }
}

/// Global iteration and cost ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationLimits {
    pub max_optimization_attempts: u32,
    pub max_monte_carlo_runs: usize,
    pub max_total_iterations: u32,
    pub max_cost_budget: f64,
    pub max_validation_retries: u32,
}

impl Default for IterationLimits {
    fn default() -> Self {
        Self {
            max_optimization_attempts: 3,
            max_monte_carlo_runs: 50,
            max_total_iterations: 10,
            max_cost_budget: 100.0,
            max_validation_retries: 1,
        }
    }
}

// ─── ThresholdConfig ─────────────────────────────────────────────────

/// All numeric bounds used by the gates, the aggregator and the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "TierThresholds::minimum_viable")]
    pub minimum_viable: TierThresholds,
    #[serde(default = "TierThresholds::optimization_worthy")]
    pub optimization_worthy: TierThresholds,
    #[serde(default = "TierThresholds::production_ready")]
    pub production_ready: TierThresholds,
    #[serde(default)]
    pub overfitting_signals: OverfittingSignals,
    #[serde(default)]
    pub degradation_thresholds: DegradationThresholds,
    #[serde(default)]
    pub optimization: OptimizationThresholds,
    #[serde(default)]
    pub validation: ValidationThresholds,
    #[serde(default)]
    pub robustness: RobustnessThresholds,
    #[serde(default)]
    pub limits: IterationLimits,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            minimum_viable: TierThresholds::minimum_viable(),
            optimization_worthy: TierThresholds::optimization_worthy(),
            production_ready: TierThresholds::production_ready(),
            overfitting_signals: OverfittingSignals::default(),
            degradation_thresholds: DegradationThresholds::default(),
            optimization: OptimizationThresholds::default(),
            validation: ValidationThresholds::default(),
            robustness: RobustnessThresholds::default(),
            limits: IterationLimits::default(),
        }
    }
}

impl ThresholdConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Deep-merge a partial document over this config and return the result.
    ///
    /// `{"limits": {"max_cost_budget": 250.0}}` changes only that one field.
    pub fn apply_overrides(&self, overrides: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(self)?;
        merge_json(&mut base, overrides);
        let merged: Self = serde_json::from_value(base)?;
        merged.validate()?;
        Ok(merged)
    }

    /// Check fractions, tier ordering and limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fractions = [
            ("minimum_viable.max_drawdown", self.minimum_viable.max_drawdown),
            ("optimization_worthy.max_drawdown", self.optimization_worthy.max_drawdown),
            ("production_ready.max_drawdown", self.production_ready.max_drawdown),
            ("overfitting_signals.win_rate_too_high", self.overfitting_signals.win_rate_too_high),
            ("validation.unstable_run_fraction", self.validation.unstable_run_fraction),
            ("robustness.consistent_ratio", self.robustness.consistent_ratio),
            ("robustness.parameter_consensus", self.robustness.parameter_consensus),
        ];
        for (field, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside [0, 1]")));
            }
        }

        let confidence = self.robustness.target_confidence;
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(invalid(
                "robustness.target_confidence",
                format!("{confidence} is outside (0, 1)"),
            ));
        }
        if !(self.robustness.annualization_factor > 0.0) {
            return Err(invalid(
                "robustness.annualization_factor",
                "must be positive".into(),
            ));
        }

        if self.minimum_viable.sharpe_ratio > self.optimization_worthy.sharpe_ratio
            || self.optimization_worthy.sharpe_ratio > self.production_ready.sharpe_ratio
        {
            return Err(invalid(
                "sharpe_ratio",
                "tiers must be non-decreasing: minimum_viable <= optimization_worthy <= production_ready".into(),
            ));
        }
        if self.production_ready.sharpe_ratio > self.overfitting_signals.too_perfect_sharpe {
            return Err(invalid(
                "overfitting_signals.too_perfect_sharpe",
                "must not be below production_ready.sharpe_ratio".into(),
            ));
        }

        let d = &self.degradation_thresholds;
        if !(d.acceptable <= d.caution && d.caution <= d.abandon) {
            return Err(invalid(
                "degradation_thresholds",
                format!(
                    "expected acceptable <= caution <= abandon, got {} / {} / {}",
                    d.acceptable, d.caution, d.abandon
                ),
            ));
        }

        let o = &self.optimization;
        if o.min_improvement > o.suspicious_improvement {
            return Err(invalid(
                "optimization.min_improvement",
                "must not exceed suspicious_improvement".into(),
            ));
        }

        if self.limits.max_total_iterations == 0 {
            return Err(invalid("limits.max_total_iterations", "must be at least 1".into()));
        }
        if self.limits.max_monte_carlo_runs == 0 {
            return Err(invalid("limits.max_monte_carlo_runs", "must be at least 1".into()));
        }
        if !(self.limits.max_cost_budget >= 0.0) {
            return Err(invalid("limits.max_cost_budget", "must be non-negative".into()));
        }
        Ok(())
    }

    /// BLAKE3 hash of the canonical JSON form, recorded in the audit trail.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn merge_json(base: &mut serde_json::Value, overrides: &serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        ThresholdConfig::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = ThresholdConfig::default();
        assert_eq!(c.minimum_viable.sharpe_ratio, 0.5);
        assert_eq!(c.optimization_worthy.min_trades, 50);
        assert_eq!(c.production_ready.max_drawdown, 0.30);
        assert_eq!(c.overfitting_signals.too_few_trades, 20);
        assert_eq!(c.degradation_thresholds.abandon, 0.40);
        assert_eq!(c.limits.max_optimization_attempts, 3);
        assert_eq!(c.limits.max_validation_retries, 1);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let toml = r#"
[overfitting_signals]
too_perfect_sharpe = 4.0

[limits]
max_cost_budget = 20.0
"#;
        let c = ThresholdConfig::from_toml_str(toml).unwrap();
        assert_eq!(c.overfitting_signals.too_perfect_sharpe, 4.0);
        assert_eq!(c.overfitting_signals.too_few_trades, 20);
        assert_eq!(c.limits.max_cost_budget, 20.0);
        assert_eq!(c.limits.max_total_iterations, 10);
        assert_eq!(c.minimum_viable, TierThresholds::minimum_viable());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.toml");
        std::fs::write(&path, "[degradation_thresholds]\nacceptable = 0.1\n").unwrap();
        let c = ThresholdConfig::load(&path).unwrap();
        assert_eq!(c.degradation_thresholds.acceptable, 0.1);
        assert_eq!(c.degradation_thresholds.caution, 0.30);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ThresholdConfig::load("/nonexistent/thresholds.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn overrides_produce_new_config() {
        let base = ThresholdConfig::default();
        let merged = base
            .apply_overrides(&json!({"limits": {"max_cost_budget": 250.0}}))
            .unwrap();
        assert_eq!(merged.limits.max_cost_budget, 250.0);
        assert_eq!(merged.limits.max_total_iterations, 10);
        assert_eq!(base.limits.max_cost_budget, 100.0, "base must be untouched");
        assert_ne!(base.fingerprint(), merged.fingerprint());
    }

    #[test]
    fn overrides_are_validated() {
        let err = ThresholdConfig::default()
            .apply_overrides(&json!({"degradation_thresholds": {"acceptable": 0.5}}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "degradation_thresholds", .. }));
    }

    #[test]
    fn misordered_tiers_rejected() {
        let mut c = ThresholdConfig::default();
        c.minimum_viable.sharpe_ratio = 2.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = ThresholdConfig::default();
        let b = ThresholdConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
