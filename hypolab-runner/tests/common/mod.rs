//! Deterministic stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;

use hypolab_core::{generate_split, DateSplit, ParameterCandidate, ParameterSet, PerformanceMetrics, SeedHierarchy};
use hypolab_runner::{
    BacktestExecutor, DatasetBounds, ExecutionError, MonteCarloConfig, MonteCarloEngine,
    Objective, OptimizationError, OptimizationOutcome, ParameterOptimizer, ParameterRange,
    ParameterSpace, RetryPolicy, StrategyRef,
};

pub const HYPOTHESIS: &str = "momentum-v1";
pub const MASTER_SEED: u64 = 42;
pub const MIN_TRAIN_DAYS: u32 = 730;
pub const MIN_TEST_DAYS: u32 = 365;

pub fn dataset() -> DatasetBounds {
    DatasetBounds {
        start: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    }
}

pub fn strategy() -> StrategyRef {
    StrategyRef::new(HYPOTHESIS)
}

pub fn lookback(value: f64) -> ParameterSet {
    let mut p = ParameterSet::new();
    p.insert("lookback".into(), value);
    p
}

pub fn space() -> ParameterSpace {
    let mut s = ParameterSpace::new();
    s.insert(
        "lookback".into(),
        ParameterRange {
            min: 10.0,
            max: 60.0,
            step: 5.0,
        },
    );
    s
}

fn metrics(sharpe: f64, start: NaiveDate, end: NaiveDate) -> PerformanceMetrics {
    let days = (end - start).num_days().max(1) as usize;
    PerformanceMetrics::new(sharpe, 0.15, 150, 0.55, 0.3, days)
}

pub fn config(runs: usize, workers: usize) -> MonteCarloConfig {
    MonteCarloConfig {
        runs_requested: runs,
        min_train_days: MIN_TRAIN_DAYS,
        min_test_days: MIN_TEST_DAYS,
        workers,
        master_seed: MASTER_SEED,
        max_failure_fraction: 0.5,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 0,
            call_timeout_secs: None,
        },
    }
}

pub fn engine(
    executor: Arc<StubExecutor>,
    optimizer: Arc<StubOptimizer>,
    config: MonteCarloConfig,
) -> MonteCarloEngine {
    MonteCarloEngine::new(executor, optimizer, config)
}

/// Splits the engine will draw for the first pass of [`HYPOTHESIS`].
pub fn expected_splits(runs: usize) -> Vec<DateSplit> {
    expected_pass_splits(0, runs)
}

pub fn expected_pass_splits(pass: u32, runs: usize) -> Vec<DateSplit> {
    let seeds = SeedHierarchy::new(MASTER_SEED);
    let d = dataset();
    (0..runs)
        .map(|i| {
            generate_split(
                d.start,
                d.end,
                MIN_TRAIN_DAYS,
                MIN_TEST_DAYS,
                seeds.pass_split_seed(HYPOTHESIS, pass, i as u64),
            )
            .unwrap()
        })
        .collect()
}

/// Test-window starts of `count` runs whose start no other run shares.
pub fn unique_test_starts(runs: usize, count: usize) -> HashSet<NaiveDate> {
    let splits = expected_splits(runs);
    let starts: Vec<NaiveDate> = splits.iter().map(|s| s.test_start).collect();
    let unique: Vec<NaiveDate> = starts
        .iter()
        .copied()
        .filter(|d| starts.iter().filter(|o| *o == d).count() == 1)
        .take(count)
        .collect();
    assert_eq!(unique.len(), count, "not enough distinct test windows");
    unique.into_iter().collect()
}

// ─── Executor ────────────────────────────────────────────────────────

/// Returns `train_sharpe` for windows starting at the dataset start and
/// `test_sharpe` for every other window.
pub struct StubExecutor {
    dataset_start: NaiveDate,
    train_sharpe: f64,
    test_sharpe: f64,
    fail_test_starts: HashSet<NaiveDate>,
    delay: Option<Duration>,
    flaky: bool,
    seen: Mutex<HashSet<(NaiveDate, NaiveDate)>>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
    pub calls: AtomicUsize,
}

impl StubExecutor {
    pub fn new(train_sharpe: f64, test_sharpe: f64) -> Self {
        Self {
            dataset_start: dataset().start,
            train_sharpe,
            test_sharpe,
            fail_test_starts: HashSet::new(),
            delay: None,
            flaky: false,
            seen: Mutex::new(HashSet::new()),
            cancel_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, test_starts: HashSet<NaiveDate>) -> Self {
        self.fail_test_starts = test_starts;
        self
    }

    /// Sleep before answering test-window calls.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first call for each window, succeed on retry.
    pub fn flaky(mut self) -> Self {
        self.flaky = true;
        self
    }

    /// Raise `flag` once `calls` calls have been made.
    pub fn cancel_after(mut self, calls: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((calls, flag));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BacktestExecutor for StubExecutor {
    fn execute(
        &self,
        _strategy: &StrategyRef,
        _parameters: &ParameterSet,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PerformanceMetrics, ExecutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = &self.cancel_after {
            if n >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if self.flaky && self.seen.lock().unwrap().insert((start, end)) {
            return Err(ExecutionError::Failed("503 service unavailable".into()));
        }
        if start == self.dataset_start {
            return Ok(metrics(self.train_sharpe, start, end));
        }
        if self.fail_test_starts.contains(&start) {
            return Err(ExecutionError::NoData { start, end });
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(metrics(self.test_sharpe, start, end))
    }
}

// ─── Optimizer ───────────────────────────────────────────────────────

pub struct StubOptimizer {
    sharpe: f64,
    best: ParameterSet,
    candidates: Vec<ParameterCandidate>,
    pub calls: AtomicUsize,
}

impl StubOptimizer {
    pub fn new(sharpe: f64, best: ParameterSet) -> Self {
        Self {
            sharpe,
            best,
            candidates: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<ParameterCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ParameterOptimizer for StubOptimizer {
    fn optimize(
        &self,
        _strategy: &StrategyRef,
        _space: &ParameterSpace,
        start: NaiveDate,
        end: NaiveDate,
        _objective: Objective,
    ) -> Result<OptimizationOutcome, OptimizationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OptimizationOutcome {
            best_parameters: self.best.clone(),
            metrics: metrics(self.sharpe, start, end),
            candidates: self.candidates.clone(),
        })
    }
}
