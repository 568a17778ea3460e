//! Integration tests for the Monte Carlo walk-forward engine against
//! deterministic stub collaborators.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use hypolab_core::{Adequacy, ParameterCandidate, SplitError, ThresholdConfig};
use hypolab_runner::{
    DatasetBounds, MonteCarloError, ParameterSource, RetryPolicy, RunStage, ValidationRequest,
};

use common::*;

fn fixed_source() -> ParameterSource {
    ParameterSource::Fixed(lookback(20.0))
}

fn request<'a>(
    strategy: &'a hypolab_runner::StrategyRef,
    source: &'a ParameterSource,
    runs: usize,
) -> ValidationRequest<'a> {
    ValidationRequest {
        hypothesis_id: HYPOTHESIS,
        strategy,
        dataset: dataset(),
        source,
        runs_requested: runs,
        pass_index: 0,
    }
}

// ── 1. Happy path ──

#[test]
fn fixed_parameters_complete_every_run() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor.clone(), optimizer.clone(), config(10, 4));
    let strategy = strategy();
    let source = fixed_source();

    let outcome = engine
        .run_validation(&request(&strategy, &source, 10), &ThresholdConfig::default(), None)
        .unwrap();

    assert_eq!(outcome.runs_used(), 10);
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.cancelled, 0);
    assert_eq!(outcome.calls.backtests, 20, "one train and one test backtest per run");
    assert_eq!(outcome.calls.optimizations, 0);
    assert_eq!(optimizer.call_count(), 0);
    assert_eq!(executor.call_count(), 20);

    let s = &outcome.summary;
    assert!((s.mean_degradation - (2.2 - 2.0) / 2.2).abs() < 1e-12);
    assert!(s.std_degradation.abs() < 1e-12);
    assert_eq!(s.fraction_good, 1.0);
    assert_eq!(s.fraction_overfit, 0.0);
    assert!(s.dsr > 0.95, "dsr = {}", s.dsr);
    assert_eq!(s.pooled_sample_count, MIN_TEST_DAYS as usize);
    assert_eq!(s.adequacy, Adequacy::Good);
    assert_eq!(s.parameter_stability.score, 1.0);
}

#[test]
fn optimize_source_reoptimizes_every_train_window() {
    let executor = Arc::new(StubExecutor::new(0.8, 0.85));
    let optimizer = Arc::new(StubOptimizer::new(0.9, lookback(35.0)));
    let engine = engine(executor.clone(), optimizer.clone(), config(8, 4));
    let strategy = strategy();
    let source = ParameterSource::Optimize(space());

    let outcome = engine
        .run_validation(&request(&strategy, &source, 8), &ThresholdConfig::default(), None)
        .unwrap();

    assert_eq!(outcome.runs_used(), 8);
    assert_eq!(optimizer.call_count(), 8);
    assert_eq!(executor.call_count(), 8, "test backtests only");
    assert!(outcome.runs.iter().all(|r| r.parameters == lookback(35.0)));
    assert!(outcome.runs.iter().all(|r| r.train_metrics.sharpe_ratio == 0.9));
}

fn candidate(value: f64, sharpe: f64) -> ParameterCandidate {
    ParameterCandidate {
        parameters: lookback(value),
        sharpe_ratio: sharpe,
    }
}

#[test]
fn sensitive_surface_validates_top_quartile_median() {
    // Top quartile of 8 is lookback 12 (2.0) and 20 (0.8): spread 0.6.
    let peaked = vec![
        candidate(12.0, 2.0),
        candidate(20.0, 0.8),
        candidate(30.0, 0.5),
        candidate(40.0, 0.4),
        candidate(50.0, 0.3),
        candidate(60.0, 0.2),
        candidate(70.0, 0.1),
        candidate(80.0, 0.0),
    ];
    let executor = Arc::new(StubExecutor::new(0.8, 0.7));
    let optimizer = Arc::new(StubOptimizer::new(2.0, lookback(12.0)).with_candidates(peaked));
    let engine = engine(executor.clone(), optimizer.clone(), config(6, 3));
    let strategy = strategy();
    let source = ParameterSource::Optimize(space());

    let outcome = engine
        .run_validation(&request(&strategy, &source, 6), &ThresholdConfig::default(), None)
        .unwrap();

    assert_eq!(outcome.runs_used(), 6);
    assert!(outcome.runs.iter().all(|r| r.parameters == lookback(16.0)));
    // Train metrics come from backtesting the median, not the optimizer's best.
    assert!(outcome.runs.iter().all(|r| r.train_metrics.sharpe_ratio == 0.8));
    assert_eq!(optimizer.call_count(), 6);
    assert_eq!(executor.call_count(), 12, "train and test backtest per run");
}

#[test]
fn splits_follow_the_seed_hierarchy() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();
    let thresholds = ThresholdConfig::default();

    let a = engine
        .run_validation(&request(&strategy, &source, 10), &thresholds, None)
        .unwrap();
    let b = engine
        .run_validation(&request(&strategy, &source, 10), &thresholds, None)
        .unwrap();

    let splits: Vec<_> = a.runs.iter().map(|r| r.split).collect();
    assert_eq!(splits, expected_splits(10));
    assert_eq!(a.summary, b.summary);
}

#[test]
fn retried_pass_draws_fresh_splits() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();
    let thresholds = ThresholdConfig::default();

    let first = engine
        .run_validation(&request(&strategy, &source, 10), &thresholds, None)
        .unwrap();
    let retry = engine
        .run_validation(
            &ValidationRequest {
                pass_index: 1,
                ..request(&strategy, &source, 10)
            },
            &thresholds,
            None,
        )
        .unwrap();

    let a: Vec<_> = first.runs.iter().map(|r| r.split).collect();
    let b: Vec<_> = retry.runs.iter().map(|r| r.split).collect();
    assert_ne!(a, b);
}

#[test]
fn requested_runs_clamped_to_limit() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(10, 8));
    let strategy = strategy();
    let source = fixed_source();
    let mut thresholds = ThresholdConfig::default();
    thresholds.limits.max_monte_carlo_runs = 12;

    let outcome = engine
        .run_validation(&request(&strategy, &source, 80), &thresholds, None)
        .unwrap();
    assert_eq!(outcome.runs_requested, 12);
    assert_eq!(outcome.runs_used(), 12);
}

// ── 2. Failures ──

#[test]
fn failed_runs_are_excluded() {
    let failing = unique_test_starts(10, 4);
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).failing_on(failing.clone()));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();

    let outcome = engine
        .run_validation(&request(&strategy, &source, 10), &ThresholdConfig::default(), None)
        .unwrap();

    assert_eq!(outcome.runs_used(), 6);
    assert_eq!(outcome.failures.len(), 4);
    for failure in &outcome.failures {
        assert_eq!(failure.stage, RunStage::TestBacktest);
        let split = failure.split.expect("failed run keeps its split");
        assert!(failing.contains(&split.test_start));
        assert!(failure.error.contains("no data"));
    }
}

#[test]
fn half_failing_is_systematic() {
    let failing = unique_test_starts(10, 5);
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).failing_on(failing));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();

    let err = engine
        .run_validation(&request(&strategy, &source, 10), &ThresholdConfig::default(), None)
        .unwrap_err();
    match err {
        MonteCarloError::SystematicFailure {
            failed, attempted, ..
        } => {
            assert_eq!(failed, 5);
            assert_eq!(attempted, 10);
        }
        other => panic!("expected systematic failure, got {other:?}"),
    }
}

#[test]
fn no_data_is_not_retried() {
    let failing = unique_test_starts(10, 2);
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).failing_on(failing));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor.clone(), optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();

    let outcome = engine
        .run_validation(&request(&strategy, &source, 10), &ThresholdConfig::default(), None)
        .unwrap();
    assert_eq!(outcome.runs_used(), 8);
    assert_eq!(executor.call_count(), 20);
}

#[test]
fn transient_failures_are_retried() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).flaky());
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor.clone(), optimizer, config(6, 3));
    let strategy = strategy();
    let source = fixed_source();

    let outcome = engine
        .run_validation(&request(&strategy, &source, 6), &ThresholdConfig::default(), None)
        .unwrap();
    assert_eq!(outcome.runs_used(), 6);
    assert!(outcome.failures.is_empty());
    assert!(outcome.calls.backtests > 12, "retries counted: {}", outcome.calls.backtests);
    assert_eq!(outcome.calls.backtests, executor.call_count());
}

#[test]
fn slow_calls_time_out_without_blocking_siblings() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).with_delay(Duration::from_secs(3)));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let mut cfg = config(4, 4);
    cfg.retry = RetryPolicy {
        max_retries: 0,
        base_delay_ms: 0,
        call_timeout_secs: Some(1),
    };
    let engine = engine(executor, optimizer, cfg);
    let strategy = strategy();
    let source = fixed_source();

    let started = std::time::Instant::now();
    let err = engine
        .run_validation(&request(&strategy, &source, 4), &ThresholdConfig::default(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        MonteCarloError::SystematicFailure {
            failed: 4,
            attempted: 4,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(3), "runs timed out in parallel");
}

#[test]
fn insufficient_history_is_fatal() {
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor.clone(), optimizer, config(10, 4));
    let strategy = strategy();
    let source = fixed_source();
    let short = DatasetBounds {
        start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
    };

    let err = engine
        .run_validation(
            &ValidationRequest {
                dataset: short,
                ..request(&strategy, &source, 10)
            },
            &ThresholdConfig::default(),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        MonteCarloError::InsufficientHistory(SplitError::InsufficientHistory { .. })
    ));
    assert_eq!(executor.call_count(), 0, "no collaborator call before the check");
}

// ── 3. Cancellation ──

#[test]
fn cancellation_keeps_completed_runs() {
    let flag = Arc::new(AtomicBool::new(false));
    // Two calls per run: raised during run 3.
    let executor = Arc::new(StubExecutor::new(2.2, 2.0).cancel_after(6, flag.clone()));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(20, 1));
    let strategy = strategy();
    let source = fixed_source();

    let outcome = engine
        .run_validation(
            &request(&strategy, &source, 20),
            &ThresholdConfig::default(),
            Some(&flag),
        )
        .unwrap();

    assert!(outcome.cancelled > 0);
    assert!(outcome.runs_used() >= 3);
    assert_eq!(outcome.runs_used() + outcome.cancelled, 20);
}

#[test]
fn cancelled_before_start_is_empty() {
    let flag = AtomicBool::new(true);
    let executor = Arc::new(StubExecutor::new(2.2, 2.0));
    let optimizer = Arc::new(StubOptimizer::new(2.2, lookback(20.0)));
    let engine = engine(executor, optimizer, config(5, 2));
    let strategy = strategy();
    let source = fixed_source();

    let err = engine
        .run_validation(
            &request(&strategy, &source, 5),
            &ThresholdConfig::default(),
            Some(&flag),
        )
        .unwrap_err();
    assert!(matches!(err, MonteCarloError::Aggregate(_)));
}
