//! Gate decisions: the routing action, why it was taken, and the evidence.

use serde::{Deserialize, Serialize};

use crate::aggregate::RobustnessSummary;
use crate::metrics::PerformanceMetrics;
use crate::state::BudgetBreach;

/// Routing action produced by a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Abandon,
    Escalate,
    ProceedToOptimization,
    ProceedToValidation,
    UseBaselineParams,
    Deploy,
    ProceedWithCaution,
    RetryValidation,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Abandon => "ABANDON",
            Action::Escalate => "ESCALATE",
            Action::ProceedToOptimization => "PROCEED_TO_OPTIMIZATION",
            Action::ProceedToValidation => "PROCEED_TO_VALIDATION",
            Action::UseBaselineParams => "USE_BASELINE_PARAMS",
            Action::Deploy => "DEPLOY",
            Action::ProceedWithCaution => "PROCEED_WITH_CAUTION",
            Action::RetryValidation => "RETRY_VALIDATION",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which evaluator produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Backtest,
    Optimization,
    Validation,
    /// Forced by an iteration or cost ceiling.
    Budget,
    /// Recorded by a human resolving an escalation.
    Review,
    /// Raised when a validation pass could not produce a summary.
    MonteCarlo,
}

/// Snapshot of the inputs behind a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Backtest {
        metrics: PerformanceMetrics,
    },
    Optimization {
        baseline: PerformanceMetrics,
        optimized: PerformanceMetrics,
        /// `None` when the baseline Sharpe is zero.
        improvement: Option<f64>,
    },
    Validation {
        summary: Box<RobustnessSummary>,
    },
    Budget {
        breach: BudgetBreach,
    },
    Review {
        reviewer: String,
    },
    Failure {
        failed: usize,
        attempted: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub gate: Gate,
    pub action: Action,
    /// Human-readable explanation; never empty.
    pub rationale: String,
    pub evidence: Evidence,
}

impl Decision {
    pub fn new(gate: Gate, action: Action, rationale: impl Into<String>, evidence: Evidence) -> Self {
        Self {
            gate,
            action,
            rationale: rationale.into(),
            evidence,
        }
    }

    /// ABANDON forced by a budget ceiling, whatever the gate would have said.
    pub fn budget_exhausted(breach: BudgetBreach) -> Self {
        Self::new(
            Gate::Budget,
            Action::Abandon,
            format!("iteration/cost budget exhausted: {breach}"),
            Evidence::Budget { breach },
        )
    }

    /// ESCALATE after too many Monte Carlo runs failed.
    pub fn systematic_failure(failed: usize, attempted: usize) -> Self {
        Self::new(
            Gate::MonteCarlo,
            Action::Escalate,
            format!("systematic failure: {failed} of {attempted} Monte Carlo runs failed"),
            Evidence::Failure { failed, attempted },
        )
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.action, self.rationale)
    }
}
