//! End-to-end driver: feeds collaborator results into the state machine
//! until the hypothesis is terminal, awaits review, or is cancelled.
//!
//! The driver owns no state of its own. Everything that must survive a
//! restart lives in the machine's [`HypothesisState`], so a driver can pick
//! up a resumed snapshot where the previous one stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use hypolab_core::{AggregateError, HypothesisState, ParameterSet, Phase};

use crate::collaborators::{
    BacktestExecutor, ExecutionError, OptimizationError, ParameterOptimizer, ParameterSpace,
    StrategyRef,
};
use crate::config::{CostModel, DatasetBounds, RunConfig};
use crate::machine::{HypothesisMachine, MachineError, NextStep, Transition};
use crate::monte_carlo::{
    CallCounter, CallCounts, MonteCarloEngine, MonteCarloError, ParameterSource,
    ValidationOutcome, ValidationRequest,
};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("validation pass failed")]
    MonteCarlo(#[from] MonteCarloError),

    #[error("full-period backtest failed")]
    Backtest(#[from] ExecutionError),

    #[error("full-period optimization failed")]
    Optimization(#[from] OptimizationError),
}

/// What to validate and how to search.
#[derive(Debug, Clone, PartialEq)]
pub struct HypothesisPlan {
    pub strategy: StrategyRef,
    /// Search space for the optimization gate and re-optimizing validation.
    pub space: ParameterSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Complete or abandoned.
    Terminal,
    AwaitingReview,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub stop: StopReason,
    pub phase: Phase,
    /// Transitions recorded by this call, oldest first.
    pub transitions: Vec<Transition>,
    /// Most recent validation pass, if one ran.
    pub last_validation: Option<ValidationOutcome>,
}

pub struct HypothesisDriver {
    engine: MonteCarloEngine,
    dataset: DatasetBounds,
    costs: CostModel,
}

impl HypothesisDriver {
    pub fn new(engine: MonteCarloEngine, dataset: DatasetBounds, costs: CostModel) -> Self {
        Self {
            engine,
            dataset,
            costs,
        }
    }

    /// Build a driver from a run config. The engine takes the config's
    /// Monte Carlo section.
    pub fn from_config(
        config: &RunConfig,
        executor: Arc<dyn BacktestExecutor>,
        optimizer: Arc<dyn ParameterOptimizer>,
    ) -> Self {
        let engine = MonteCarloEngine::new(executor, optimizer, config.monte_carlo.clone());
        Self::new(engine, config.dataset, config.costs.clone())
    }

    pub fn engine(&self) -> &MonteCarloEngine {
        &self.engine
    }

    pub fn drive(
        &self,
        machine: &mut HypothesisMachine,
        plan: &HypothesisPlan,
        cancel: Option<&AtomicBool>,
    ) -> Result<DriveOutcome, DriverError> {
        self.drive_with(machine, plan, cancel, |_, _| {})
    }

    /// Drive until a stop condition, calling `on_transition` with each new
    /// record and the state after it. Persist the snapshot there.
    pub fn drive_with(
        &self,
        machine: &mut HypothesisMachine,
        plan: &HypothesisPlan,
        cancel: Option<&AtomicBool>,
        mut on_transition: impl FnMut(&Transition, &HypothesisState),
    ) -> Result<DriveOutcome, DriverError> {
        let mut transitions = Vec::new();
        let mut last_validation = None;
        let is_cancelled = || cancel.is_some_and(|f| f.load(Ordering::Relaxed));

        let stop = loop {
            let step = machine.next_step();
            match step {
                NextStep::Done => break StopReason::Terminal,
                NextStep::AwaitReview => break StopReason::AwaitingReview,
                _ if is_cancelled() => break StopReason::Cancelled,
                _ => {}
            }

            let transition = match step {
                NextStep::RunBacktest => self.backtest_step(machine, plan)?,
                NextStep::Optimize => self.optimize_step(machine, plan)?,
                NextStep::ValidateBaseline | NextStep::ValidateOptimized => {
                    let source = if step == NextStep::ValidateOptimized {
                        ParameterSource::Optimize(plan.space.clone())
                    } else {
                        ParameterSource::Fixed(machine.state().validation_parameters().clone())
                    };
                    match self.validation_step(machine, plan, &source, cancel)? {
                        Some((transition, outcome)) => {
                            if outcome.is_some() {
                                last_validation = outcome;
                            }
                            transition
                        }
                        None => break StopReason::Cancelled,
                    }
                }
                NextStep::AwaitReview | NextStep::Done => continue,
            };

            on_transition(&transition, machine.state());
            transitions.push(transition);

            if is_cancelled() && !machine.state().is_terminal() {
                break StopReason::Cancelled;
            }
        };

        let phase = machine.state().phase;
        info!(
            hypothesis = %machine.state().hypothesis_id,
            %phase,
            ?stop,
            transitions = transitions.len(),
            cost = machine.state().cumulative_cost,
            "driver stopped"
        );
        Ok(DriveOutcome {
            stop,
            phase,
            transitions,
            last_validation,
        })
    }

    fn backtest_step(
        &self,
        machine: &mut HypothesisMachine,
        plan: &HypothesisPlan,
    ) -> Result<Transition, DriverError> {
        if machine.state().phase == Phase::Research {
            machine.begin_implementation()?;
        }
        if machine.state().phase == Phase::Implementation {
            machine.begin_backtest()?;
        }

        let counter = CallCounter::default();
        let parameters: ParameterSet = machine.state().baseline_parameters.clone();
        let result = self.engine.execute(
            &plan.strategy,
            &parameters,
            self.dataset.start,
            self.dataset.end,
            &counter,
        );
        self.charge(machine, counter.counts());
        Ok(machine.submit_backtest(result?)?)
    }

    fn optimize_step(
        &self,
        machine: &mut HypothesisMachine,
        plan: &HypothesisPlan,
    ) -> Result<Transition, DriverError> {
        let counter = CallCounter::default();
        let result = self.engine.optimize(
            &plan.strategy,
            &plan.space,
            self.dataset.start,
            self.dataset.end,
            &counter,
        );
        self.charge(machine, counter.counts());
        let outcome = result?;
        Ok(machine.submit_optimization(outcome.best_parameters, outcome.metrics, &outcome.candidates)?)
    }

    /// `None` when the pass was cancelled before any run completed.
    fn validation_step(
        &self,
        machine: &mut HypothesisMachine,
        plan: &HypothesisPlan,
        source: &ParameterSource,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<(Transition, Option<ValidationOutcome>)>, DriverError> {
        let state = machine.state();
        let request = ValidationRequest {
            hypothesis_id: &state.hypothesis_id,
            strategy: &plan.strategy,
            dataset: self.dataset,
            source,
            runs_requested: self.engine.config().runs_requested,
            pass_index: state.counters.validation_passes,
        };
        let result = self.engine.run_validation(&request, &state.thresholds, cancel);

        match result {
            Ok(outcome) => {
                self.charge(machine, outcome.calls);
                let transition = machine.submit_validation(&outcome.summary)?;
                Ok(Some((transition, Some(outcome))))
            }
            Err(MonteCarloError::SystematicFailure {
                failed,
                attempted,
                calls,
            }) => {
                self.charge(machine, calls);
                let transition = machine.record_systematic_failure(failed, attempted)?;
                Ok(Some((transition, None)))
            }
            Err(MonteCarloError::Aggregate(AggregateError::EmptyRunSet))
                if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) =>
            {
                warn!(
                    hypothesis = %machine.state().hypothesis_id,
                    "validation cancelled before any run completed"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn charge(&self, machine: &mut HypothesisMachine, calls: CallCounts) {
        let cost = calls.backtests as f64 * self.costs.per_backtest
            + calls.optimizations as f64 * self.costs.per_optimization;
        machine.charge(cost);
    }
}
