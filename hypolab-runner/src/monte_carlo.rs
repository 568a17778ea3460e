//! Monte Carlo walk-forward validation.
//!
//! Each run draws a randomized train/test split, chooses parameters on the
//! train window (re-optimizing or reusing a fixed set), backtests them on the
//! unseen test window and records the degradation. Runs are independent and
//! dispatched to a worker pool sized for collaborator latency.
//!
//! A failed run (collaborator error, missing data, timeout) is logged with
//! its split and excluded. When too many runs fail, the whole pass is a
//! systematic failure instead of a summary built on too few samples.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use hypolab_core::{
    aggregate, generate_split, select_parameters, AggregateError, ChoiceSource, DateSplit,
    MonteCarloRun, ParameterSet, PerformanceMetrics, RobustnessSummary, SeedHierarchy,
    SplitError, ThresholdConfig,
};

use crate::collaborators::{
    BacktestExecutor, ExecutionError, Objective, OptimizationError, OptimizationOutcome,
    ParameterOptimizer, ParameterSpace, StrategyRef,
};
use crate::config::{DatasetBounds, MonteCarloConfig};
use crate::retry::{call_with_timeout, with_retry, CallFailure};

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MonteCarloError {
    #[error(transparent)]
    InsufficientHistory(#[from] SplitError),

    #[error("systematic failure: {failed} of {attempted} Monte Carlo runs failed")]
    SystematicFailure {
        failed: usize,
        attempted: usize,
        /// Collaborator calls already made by the pass.
        calls: CallCounts,
    },

    #[error("aggregation failed")]
    Aggregate(#[from] AggregateError),

    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

// ─── Inputs / outputs ────────────────────────────────────────────────

/// Where each run's parameters come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSource {
    /// Re-optimize on every train window. A parameter-sensitive surface
    /// swaps the best point for the top-quartile median, which is then
    /// backtested on the train window.
    Optimize(ParameterSpace),
    /// Evaluate one fixed set on both windows.
    Fixed(ParameterSet),
}

/// One validation pass to run.
#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub hypothesis_id: &'a str,
    pub strategy: &'a StrategyRef,
    pub dataset: DatasetBounds,
    pub source: &'a ParameterSource,
    pub runs_requested: usize,
    /// Zero for the first pass; retries use fresh splits.
    pub pass_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Split,
    Optimize,
    TrainBacktest,
    TestBacktest,
}

/// A run excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub run_index: usize,
    pub split: Option<DateSplit>,
    pub stage: RunStage,
    pub error: String,
}

/// Collaborator calls made during a pass, retries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCounts {
    pub backtests: usize,
    pub optimizations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub summary: RobustnessSummary,
    pub runs: Vec<MonteCarloRun>,
    pub failures: Vec<RunFailure>,
    pub runs_requested: usize,
    /// Runs skipped because the batch was cancelled before they started.
    pub cancelled: usize,
    pub calls: CallCounts,
}

impl ValidationOutcome {
    /// Runs that made it into the summary.
    pub fn runs_used(&self) -> usize {
        self.summary.runs_used
    }
}

enum RunOutcome {
    Completed(MonteCarloRun),
    Failed(RunFailure),
    Cancelled,
}

#[derive(Default)]
pub(crate) struct CallCounter {
    backtests: AtomicUsize,
    optimizations: AtomicUsize,
}

impl CallCounter {
    pub(crate) fn counts(&self) -> CallCounts {
        CallCounts {
            backtests: self.backtests.load(Ordering::Relaxed),
            optimizations: self.optimizations.load(Ordering::Relaxed),
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────

pub struct MonteCarloEngine {
    executor: Arc<dyn BacktestExecutor>,
    optimizer: Arc<dyn ParameterOptimizer>,
    config: MonteCarloConfig,
}

impl MonteCarloEngine {
    pub fn new(
        executor: Arc<dyn BacktestExecutor>,
        optimizer: Arc<dyn ParameterOptimizer>,
        config: MonteCarloConfig,
    ) -> Self {
        Self {
            executor,
            optimizer,
            config,
        }
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn BacktestExecutor> {
        &self.executor
    }

    pub fn optimizer(&self) -> &Arc<dyn ParameterOptimizer> {
        &self.optimizer
    }

    /// Run one validation pass and aggregate the surviving runs.
    ///
    /// Raising `cancel` skips runs that have not started yet; runs already
    /// completed are still aggregated.
    pub fn run_validation(
        &self,
        request: &ValidationRequest<'_>,
        thresholds: &ThresholdConfig,
        cancel: Option<&AtomicBool>,
    ) -> Result<ValidationOutcome, MonteCarloError> {
        let cfg = &self.config;
        let max_runs = thresholds.limits.max_monte_carlo_runs;
        let runs_requested = if request.runs_requested > max_runs {
            warn!(
                requested = request.runs_requested,
                max = max_runs,
                "runs requested exceed limit, clamping"
            );
            max_runs
        } else {
            request.runs_requested
        };

        let seeds = SeedHierarchy::new(cfg.master_seed);

        // Insufficient history is fatal and identical for every run.
        generate_split(
            request.dataset.start,
            request.dataset.end,
            cfg.min_train_days,
            cfg.min_test_days,
            seeds.pass_split_seed(request.hypothesis_id, request.pass_index, 0),
        )?;

        info!(
            hypothesis = request.hypothesis_id,
            strategy = %request.strategy,
            runs = runs_requested,
            pass = request.pass_index,
            workers = cfg.workers,
            "starting Monte Carlo validation"
        );

        let counter = CallCounter::default();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.workers)
            .build()?;
        let outcomes: Vec<RunOutcome> = pool.install(|| {
            (0..runs_requested)
                .into_par_iter()
                .map(|i| self.run_one(i, request, &seeds, thresholds, &counter, cancel))
                .collect()
        });

        let mut runs = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = 0;
        for outcome in outcomes {
            match outcome {
                RunOutcome::Completed(run) => runs.push(run),
                RunOutcome::Failed(failure) => failures.push(failure),
                RunOutcome::Cancelled => cancelled += 1,
            }
        }

        let attempted = runs.len() + failures.len();
        if attempted > 0 {
            let failure_fraction = failures.len() as f64 / attempted as f64;
            if failure_fraction >= cfg.max_failure_fraction {
                error!(
                    hypothesis = request.hypothesis_id,
                    failed = failures.len(),
                    attempted,
                    "systematic Monte Carlo failure"
                );
                return Err(MonteCarloError::SystematicFailure {
                    failed: failures.len(),
                    attempted,
                    calls: counter.counts(),
                });
            }
        }

        let summary = aggregate(&runs, thresholds)?;
        info!(
            hypothesis = request.hypothesis_id,
            runs_used = summary.runs_used,
            failed = failures.len(),
            cancelled,
            mean_degradation = summary.mean_degradation,
            dsr = summary.dsr,
            "Monte Carlo validation complete"
        );

        Ok(ValidationOutcome {
            summary,
            runs,
            failures,
            runs_requested,
            cancelled,
            calls: counter.counts(),
        })
    }

    fn run_one(
        &self,
        run_index: usize,
        request: &ValidationRequest<'_>,
        seeds: &SeedHierarchy,
        thresholds: &ThresholdConfig,
        counter: &CallCounter,
        cancel: Option<&AtomicBool>,
    ) -> RunOutcome {
        if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return RunOutcome::Cancelled;
        }

        let fail = |split: Option<DateSplit>, stage: RunStage, error: String| {
            warn!(
                run = run_index,
                split = ?split,
                ?stage,
                %error,
                "Monte Carlo run failed, excluding from aggregation"
            );
            RunOutcome::Failed(RunFailure {
                run_index,
                split,
                stage,
                error,
            })
        };

        let split = match generate_split(
            request.dataset.start,
            request.dataset.end,
            self.config.min_train_days,
            self.config.min_test_days,
            seeds.pass_split_seed(request.hypothesis_id, request.pass_index, run_index as u64),
        ) {
            Ok(split) => split,
            Err(e) => return fail(None, RunStage::Split, e.to_string()),
        };

        let mut train_stage = match request.source {
            ParameterSource::Optimize(_) => RunStage::Optimize,
            ParameterSource::Fixed(_) => RunStage::TrainBacktest,
        };
        let (parameters, train_metrics) = match request.source {
            ParameterSource::Optimize(space) => {
                match self.optimize(
                    request.strategy,
                    space,
                    split.train_start,
                    split.train_end,
                    counter,
                ) {
                    Ok(outcome) => {
                        let choice = select_parameters(
                            &outcome.best_parameters,
                            &outcome.candidates,
                            &thresholds.optimization,
                        );
                        if choice.source == ChoiceSource::Best {
                            (choice.parameters, outcome.metrics)
                        } else {
                            debug!(
                                run = run_index,
                                spread = choice.spread,
                                "Sharpe sensitive to parameters, using top-quartile median"
                            );
                            // The optimizer's metrics belong to its best point.
                            train_stage = RunStage::TrainBacktest;
                            match self.execute(
                                request.strategy,
                                &choice.parameters,
                                split.train_start,
                                split.train_end,
                                counter,
                            ) {
                                Ok(metrics) => (choice.parameters, metrics),
                                Err(e) => {
                                    return fail(Some(split), RunStage::TrainBacktest, e.to_string())
                                }
                            }
                        }
                    }
                    Err(e) => return fail(Some(split), RunStage::Optimize, e.to_string()),
                }
            }
            ParameterSource::Fixed(parameters) => {
                match self.execute(
                    request.strategy,
                    parameters,
                    split.train_start,
                    split.train_end,
                    counter,
                ) {
                    Ok(metrics) => (parameters.clone(), metrics),
                    Err(e) => return fail(Some(split), RunStage::TrainBacktest, e.to_string()),
                }
            }
        };
        if let Some((field, value)) = train_metrics.malformed_field() {
            return fail(Some(split), train_stage, format!("malformed metrics: {field} = {value}"));
        }

        let test_metrics = match self.execute(
            request.strategy,
            &parameters,
            split.test_start,
            split.test_end,
            counter,
        ) {
            Ok(metrics) => metrics,
            Err(e) => return fail(Some(split), RunStage::TestBacktest, e.to_string()),
        };
        if let Some((field, value)) = test_metrics.malformed_field() {
            return fail(
                Some(split),
                RunStage::TestBacktest,
                format!("malformed metrics: {field} = {value}"),
            );
        }

        let run = MonteCarloRun::new(run_index, split, parameters, train_metrics, test_metrics);
        debug!(
            run = run_index,
            %split,
            train_sharpe = run.train_metrics.sharpe_ratio,
            test_sharpe = run.test_metrics.sharpe_ratio,
            degradation = run.degradation,
            "Monte Carlo run complete"
        );
        RunOutcome::Completed(run)
    }

    /// One backtest with the pass's retry and timeout policy.
    pub(crate) fn execute(
        &self,
        strategy: &StrategyRef,
        parameters: &ParameterSet,
        start: NaiveDate,
        end: NaiveDate,
        counter: &CallCounter,
    ) -> Result<PerformanceMetrics, ExecutionError> {
        let timeout = self.config.retry.timeout();
        with_retry(&self.config.retry, "backtest", ExecutionError::is_retryable, |_| {
            counter.backtests.fetch_add(1, Ordering::Relaxed);
            let executor = Arc::clone(&self.executor);
            let strategy = strategy.clone();
            let parameters = parameters.clone();
            call_with_timeout(timeout, move || {
                executor.execute(&strategy, &parameters, start, end)
            })
            .unwrap_or_else(|failure| {
                Err(match failure {
                    CallFailure::TimedOut(after) => ExecutionError::Timeout { after },
                    CallFailure::Panicked => ExecutionError::Failed("executor panicked".into()),
                })
            })
        })
    }

    /// One parameter search with the pass's retry and timeout policy.
    pub(crate) fn optimize(
        &self,
        strategy: &StrategyRef,
        space: &ParameterSpace,
        start: NaiveDate,
        end: NaiveDate,
        counter: &CallCounter,
    ) -> Result<OptimizationOutcome, OptimizationError> {
        let timeout = self.config.retry.timeout();
        with_retry(&self.config.retry, "optimize", OptimizationError::is_retryable, |_| {
            counter.optimizations.fetch_add(1, Ordering::Relaxed);
            let optimizer = Arc::clone(&self.optimizer);
            let strategy = strategy.clone();
            let space = space.clone();
            call_with_timeout(timeout, move || {
                optimizer.optimize(&strategy, &space, start, end, Objective::Sharpe)
            })
            .unwrap_or_else(|failure| {
                Err(match failure {
                    CallFailure::TimedOut(after) => OptimizationError::Timeout { after },
                    CallFailure::Panicked => {
                        OptimizationError::Failed("optimizer panicked".into())
                    }
                })
            })
        })
    }
}
