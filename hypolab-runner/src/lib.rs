//! Hypolab Runner: orchestration around the pure core.
//!
//! - Collaborator traits for the Backtest Executor and Parameter Optimizer
//! - Retry and per-call timeout plumbing
//! - Monte Carlo walk-forward engine on a rayon worker pool
//! - Hypothesis state machine with budget enforcement and escalation review
//! - Driver that runs a hypothesis from research to a terminal phase
//! - TOML run configuration

pub mod collaborators;
pub mod config;
pub mod driver;
pub mod machine;
pub mod monte_carlo;
pub mod retry;

pub use collaborators::{
    BacktestExecutor, ExecutionError, Objective, OptimizationError, OptimizationOutcome,
    ParameterOptimizer, ParameterRange, ParameterSpace, StrategyRef,
};
pub use config::{CostModel, DatasetBounds, MonteCarloConfig, RunConfig, RunConfigError};
pub use driver::{DriveOutcome, DriverError, HypothesisDriver, HypothesisPlan, StopReason};
pub use machine::{HypothesisMachine, MachineError, NextStep, Transition};
pub use monte_carlo::{
    CallCounts, MonteCarloEngine, MonteCarloError, ParameterSource, RunFailure, RunStage,
    ValidationOutcome, ValidationRequest,
};
pub use retry::RetryPolicy;
