//! External collaborators: the Backtest Executor and the Parameter Optimizer.
//!
//! Both are remote in practice (cloud backtests, grid searches), so the
//! traits are `Send + Sync` and shared across workers as `Arc<dyn ...>`.
//! Implementations must be idempotent for identical inputs.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hypolab_core::{ParameterCandidate, ParameterSet, PerformanceMetrics};

// ─── Inputs ──────────────────────────────────────────────────────────

/// Opaque reference to an implemented strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyRef {
    pub id: String,
    #[serde(default)]
    pub revision: Option<String>,
}

impl StrategyRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
        }
    }
}

impl std::fmt::Display for StrategyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.id, rev),
            None => f.write_str(&self.id),
        }
    }
}

/// Inclusive search range of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

pub type ParameterSpace = BTreeMap<String, ParameterRange>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Sharpe,
}

/// Best point of a parameter search plus everything else it evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best_parameters: ParameterSet,
    /// In-sample metrics of `best_parameters`.
    pub metrics: PerformanceMetrics,
    /// All evaluated points, for the parameter-sensitivity check. May be empty.
    #[serde(default)]
    pub candidates: Vec<ParameterCandidate>,
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("no data for {start}..{end}")]
    NoData { start: NaiveDate, end: NaiveDate },

    #[error("backtest timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("backtest failed: {0}")]
    Failed(String),
}

impl ExecutionError {
    /// Missing data will not appear on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::NoData { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("no data for {start}..{end}")]
    NoData { start: NaiveDate, end: NaiveDate },

    #[error("optimization timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("optimization found no valid parameter set")]
    NoValidCandidate,

    #[error("optimization failed: {0}")]
    Failed(String),
}

impl OptimizationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OptimizationError::Timeout { .. } | OptimizationError::Failed(_))
    }
}

// ─── Traits ──────────────────────────────────────────────────────────

pub trait BacktestExecutor: Send + Sync {
    fn execute(
        &self,
        strategy: &StrategyRef,
        parameters: &ParameterSet,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PerformanceMetrics, ExecutionError>;
}

pub trait ParameterOptimizer: Send + Sync {
    fn optimize(
        &self,
        strategy: &StrategyRef,
        space: &ParameterSpace,
        start: NaiveDate,
        end: NaiveDate,
        objective: Objective,
    ) -> Result<OptimizationOutcome, OptimizationError>;
}
