//! Hypothesis state: phase, counters, cost, pending review and the audit trail.
//!
//! The state is a plain serializable value. The caller owns persistence;
//! [`HypothesisState::to_json`] / [`HypothesisState::from_json`] produce and
//! consume the snapshot handed back after every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decision::{Decision, Gate};
use crate::metrics::{ParameterSet, PerformanceMetrics};
use crate::thresholds::ThresholdConfig;

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state snapshot")]
    Json(#[from] serde_json::Error),

    #[error("unsupported snapshot schema version {found} (this build reads up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
}

// ─── Phases ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Implementation,
    Backtest,
    Optimization,
    Validation,
    Complete,
    Abandoned,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Implementation => "implementation",
            Phase::Backtest => "backtest",
            Phase::Optimization => "optimization",
            Phase::Validation => "validation",
            Phase::Complete => "complete",
            Phase::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Iteration counters, incremented as each gate is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseCounters {
    pub backtest_runs: u32,
    pub optimization_attempts: u32,
    pub validation_passes: u32,
    /// RETRY_VALIDATION decisions taken so far.
    pub validation_retries: u32,
    /// Gate submissions across all phases.
    pub total_iterations: u32,
}

// ─── Budget ──────────────────────────────────────────────────────────

/// An iteration or cost ceiling that was exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "limit", rename_all = "snake_case")]
pub enum BudgetBreach {
    OptimizationAttempts { used: u32, max: u32 },
    TotalIterations { used: u32, max: u32 },
    CostBudget { spent: f64, max: f64 },
}

impl std::fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetBreach::OptimizationAttempts { used, max } => {
                write!(f, "{used} optimization attempts exceed limit {max}")
            }
            BudgetBreach::TotalIterations { used, max } => {
                write!(f, "{used} total iterations exceed limit {max}")
            }
            BudgetBreach::CostBudget { spent, max } => {
                write!(f, "cost {spent:.2} exceeds budget {max:.2}")
            }
        }
    }
}

// ─── Audit trail ─────────────────────────────────────────────────────

/// One immutable entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence: usize,
    pub from: Phase,
    pub to: Phase,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,
}

/// An ESCALATE awaiting a human resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub gate: Gate,
    /// Sequence number of the ESCALATE record.
    pub decision_sequence: usize,
    pub rationale: String,
}

// ─── HypothesisState ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub hypothesis_id: String,
    pub phase: Phase,
    #[serde(default)]
    pub counters: PhaseCounters,
    #[serde(default)]
    pub cumulative_cost: f64,
    pub thresholds: ThresholdConfig,
    /// BLAKE3 fingerprint of `thresholds` at hypothesis start.
    pub thresholds_fingerprint: String,
    #[serde(default)]
    pub pending_review: Option<PendingReview>,
    /// Parameters the strategy was implemented with.
    #[serde(default)]
    pub baseline_parameters: ParameterSet,
    #[serde(default)]
    pub baseline_metrics: Option<PerformanceMetrics>,
    /// Optimized parameters chosen by the optimization gate, if any.
    #[serde(default)]
    pub optimized_parameters: Option<ParameterSet>,
    /// Validate with the fixed baseline instead of re-optimizing per split.
    #[serde(default)]
    pub validate_with_baseline: bool,
    pub created_at: DateTime<Utc>,
    decisions: Vec<DecisionRecord>,
}

impl HypothesisState {
    pub fn new(
        hypothesis_id: impl Into<String>,
        thresholds: ThresholdConfig,
        baseline_parameters: ParameterSet,
        created_at: DateTime<Utc>,
    ) -> Self {
        let thresholds_fingerprint = thresholds.fingerprint();
        Self {
            schema_version: SCHEMA_VERSION,
            hypothesis_id: hypothesis_id.into(),
            phase: Phase::Research,
            counters: PhaseCounters::default(),
            cumulative_cost: 0.0,
            thresholds,
            thresholds_fingerprint,
            pending_review: None,
            baseline_parameters,
            baseline_metrics: None,
            optimized_parameters: None,
            validate_with_baseline: false,
            created_at,
            decisions: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// The audit trail, oldest first.
    pub fn decisions(&self) -> &[DecisionRecord] {
        &self.decisions
    }

    pub fn last_decision(&self) -> Option<&DecisionRecord> {
        self.decisions.last()
    }

    /// Append a decision and move to `to`. History is never rewritten.
    pub fn record_transition(
        &mut self,
        decision: Decision,
        to: Phase,
        recorded_at: DateTime<Utc>,
    ) -> &DecisionRecord {
        let record = DecisionRecord {
            sequence: self.decisions.len(),
            from: self.phase,
            to,
            decision,
            recorded_at,
        };
        self.phase = to;
        self.decisions.push(record);
        &self.decisions[self.decisions.len() - 1]
    }

    /// First exceeded ceiling, if any.
    pub fn check_budget(&self) -> Option<BudgetBreach> {
        let limits = &self.thresholds.limits;
        if self.counters.optimization_attempts > limits.max_optimization_attempts {
            return Some(BudgetBreach::OptimizationAttempts {
                used: self.counters.optimization_attempts,
                max: limits.max_optimization_attempts,
            });
        }
        if self.counters.total_iterations > limits.max_total_iterations {
            return Some(BudgetBreach::TotalIterations {
                used: self.counters.total_iterations,
                max: limits.max_total_iterations,
            });
        }
        if self.cumulative_cost > limits.max_cost_budget {
            return Some(BudgetBreach::CostBudget {
                spent: self.cumulative_cost,
                max: limits.max_cost_budget,
            });
        }
        None
    }

    /// Parameters the next validation pass should use.
    pub fn validation_parameters(&self) -> &ParameterSet {
        match (&self.optimized_parameters, self.validate_with_baseline) {
            (Some(optimized), false) => optimized,
            _ => &self.baseline_parameters,
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        let state: Self = serde_json::from_str(json)?;
        if state.schema_version > SCHEMA_VERSION {
            return Err(StateError::UnsupportedSchema {
                found: state.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(state)
    }
}
