//! Hypolab Core: pure domain for autonomous hypothesis validation.
//!
//! This crate contains everything that can be computed without touching the
//! outside world:
//! - Performance metrics and parameter sets reported by external collaborators
//! - Threshold configuration (tiers, overfitting signals, degradation, limits)
//! - Boundary-safe randomized train/test date splits
//! - Deterministic seed hierarchy for Monte Carlo runs
//! - Robustness statistics (PSR, DSR, MinTRL, percentiles, stability)
//! - The three gate evaluators (backtest, optimization, validation)
//! - Hypothesis state, phases, budgets and the decision audit trail

pub mod aggregate;
pub mod decision;
pub mod gates;
pub mod metrics;
pub mod seed;
pub mod split;
pub mod state;
pub mod stats;
pub mod thresholds;

pub use aggregate::{
    aggregate, AggregateError, MonteCarloRun, ParameterConsensus, ParameterStability,
    Percentiles, RobustnessFlag, RobustnessSummary,
};
pub use decision::{Action, Decision, Evidence, Gate};
pub use gates::{
    evaluate_backtest, evaluate_optimization, evaluate_validation, select_parameters,
    ChoiceSource, GateError, ParameterChoice,
};
pub use metrics::{ParameterCandidate, ParameterSet, PerformanceMetrics};
pub use seed::SeedHierarchy;
pub use split::{generate_split, DateSplit, SplitError};
pub use state::{
    BudgetBreach, DecisionRecord, HypothesisState, PendingReview, Phase, PhaseCounters,
    StateError,
};
pub use stats::Adequacy;
pub use thresholds::{ConfigError, ThresholdConfig};
