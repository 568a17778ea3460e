use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{check_metrics, GateError};
use crate::decision::{Action, Decision, Evidence, Gate};
use crate::metrics::{ParameterCandidate, ParameterSet, PerformanceMetrics};
use crate::state::PhaseCounters;
use crate::stats;
use crate::thresholds::{OptimizationThresholds, ThresholdConfig};

/// Tolerance applied to the suspicious-improvement boundary, so that
/// 1.3 vs 1.0 lands on the boundary despite f64 rounding.
const BOUNDARY_EPSILON: f64 = 1e-9;

/// Relative Sharpe improvement of `optimized` over `baseline`.
///
/// Measured against `|baseline|` so a negative baseline still yields a
/// positive improvement when the optimizer helps. `None` when the baseline
/// is exactly zero.
pub fn relative_improvement(baseline: f64, optimized: f64) -> Option<f64> {
    if baseline == 0.0 {
        None
    } else {
        Some((optimized - baseline) / baseline.abs())
    }
}

/// Optimization gate.
pub fn evaluate_optimization(
    baseline: &PerformanceMetrics,
    optimized: &PerformanceMetrics,
    thresholds: &ThresholdConfig,
    _history: &PhaseCounters,
) -> Result<Decision, GateError> {
    check_metrics(baseline)?;
    check_metrics(optimized)?;

    let t = &thresholds.optimization;
    let improvement = relative_improvement(baseline.sharpe_ratio, optimized.sharpe_ratio);
    let decide = |action, rationale: String| {
        Ok(Decision::new(
            Gate::Optimization,
            action,
            rationale,
            Evidence::Optimization {
                baseline: baseline.clone(),
                optimized: optimized.clone(),
                improvement,
            },
        ))
    };

    let Some(improvement) = improvement else {
        return if optimized.sharpe_ratio > 0.0 {
            decide(
                Action::Escalate,
                format!(
                    "suspicious improvement from a zero baseline to Sharpe {:.2}, possible overfit",
                    optimized.sharpe_ratio
                ),
            )
        } else {
            decide(
                Action::UseBaselineParams,
                "optimization did not improve on a zero baseline".to_string(),
            )
        };
    };

    let pct = improvement * 100.0;
    if improvement >= t.suspicious_improvement - BOUNDARY_EPSILON {
        return decide(
            Action::Escalate,
            format!("suspicious improvement {pct:.1}%, possible overfit"),
        );
    }
    if improvement < 0.0 {
        return decide(
            Action::UseBaselineParams,
            format!("optimized parameters underperform baseline ({pct:.1}%)"),
        );
    }
    if improvement < t.min_improvement {
        return decide(
            Action::UseBaselineParams,
            format!("improvement {pct:.1}% too small to justify added parameters"),
        );
    }
    decide(
        Action::ProceedToValidation,
        format!("improvement {pct:.1}%; validate optimized parameters"),
    )
}

// ─── Parameter sensitivity ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceSource {
    /// The optimizer's single best point.
    Best,
    /// Per-parameter median of the top-quartile points.
    TopQuartileMedian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterChoice {
    pub parameters: ParameterSet,
    pub source: ChoiceSource,
    /// Normalized Sharpe spread across the top quartile, when measurable.
    pub spread: Option<f64>,
}

/// Replace the single best parameter set with the top-quartile median when
/// Sharpe is too sensitive to the parameters.
///
/// Needs at least four finite candidates to form a quartile.
pub fn select_parameters(
    best: &ParameterSet,
    candidates: &[ParameterCandidate],
    thresholds: &OptimizationThresholds,
) -> ParameterChoice {
    let keep_best = |spread| ParameterChoice {
        parameters: best.clone(),
        source: ChoiceSource::Best,
        spread,
    };

    let mut ranked: Vec<&ParameterCandidate> =
        candidates.iter().filter(|c| c.sharpe_ratio.is_finite()).collect();
    if ranked.len() < 4 {
        return keep_best(None);
    }
    ranked.sort_by(|a, b| {
        b.sharpe_ratio
            .partial_cmp(&a.sharpe_ratio)
            .unwrap_or(Ordering::Equal)
    });
    let quartile = &ranked[..ranked.len().div_ceil(4)];

    let top = quartile[0].sharpe_ratio;
    let bottom = quartile[quartile.len() - 1].sharpe_ratio;
    if top.abs() <= f64::EPSILON {
        return keep_best(None);
    }
    let spread = (top - bottom) / top.abs();
    if spread <= thresholds.sensitivity_spread {
        return keep_best(Some(spread));
    }

    let mut parameters = ParameterSet::new();
    for name in best.keys() {
        let values: Vec<f64> = quartile
            .iter()
            .filter_map(|c| c.parameters.get(name).copied())
            .collect();
        let value = if values.is_empty() {
            best[name]
        } else {
            stats::median(&values)
        };
        parameters.insert(name.clone(), value);
    }

    ParameterChoice {
        parameters,
        source: ChoiceSource::TopQuartileMedian,
        spread: Some(spread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(sharpe: f64) -> PerformanceMetrics {
        PerformanceMetrics::new(sharpe, 0.15, 80, 0.55, 0.3, 500)
    }

    fn eval(base: f64, opt: f64) -> Decision {
        evaluate_optimization(
            &m(base),
            &m(opt),
            &ThresholdConfig::default(),
            &PhaseCounters::default(),
        )
        .unwrap()
    }

    #[test]
    fn thirty_percent_exactly_escalates() {
        assert_eq!(eval(1.0, 1.3).action, Action::Escalate);
    }

    #[test]
    fn just_below_boundary_proceeds() {
        assert_eq!(eval(1.0, 1.29).action, Action::ProceedToValidation);
    }

    #[test]
    fn large_improvement_escalates() {
        let d = eval(0.8, 1.6);
        assert_eq!(d.action, Action::Escalate);
        assert!(d.rationale.contains("possible overfit"));
    }

    #[test]
    fn regression_uses_baseline() {
        let d = eval(1.0, 0.9);
        assert_eq!(d.action, Action::UseBaselineParams);
        assert!(d.rationale.contains("underperform"));
    }

    #[test]
    fn tiny_improvement_uses_baseline() {
        let d = eval(1.0, 1.03);
        assert_eq!(d.action, Action::UseBaselineParams);
        assert!(d.rationale.contains("too small"));
    }

    #[test]
    fn five_percent_proceeds() {
        assert_eq!(eval(1.0, 1.06).action, Action::ProceedToValidation);
    }

    #[test]
    fn negative_baseline_measured_on_magnitude() {
        assert!((relative_improvement(-0.5, -0.4).unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(eval(-0.5, -0.4).action, Action::ProceedToValidation);
    }

    #[test]
    fn zero_baseline() {
        assert_eq!(eval(0.0, 0.4).action, Action::Escalate);
        assert_eq!(eval(0.0, 0.0).action, Action::UseBaselineParams);
        assert_eq!(eval(0.0, -0.2).action, Action::UseBaselineParams);
    }

    #[test]
    fn evidence_records_improvement() {
        let d = eval(1.0, 1.1);
        match d.evidence {
            Evidence::Optimization { improvement, .. } => {
                assert!((improvement.unwrap() - 0.1).abs() < 1e-9)
            }
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    fn candidate(lookback: f64, sharpe: f64) -> ParameterCandidate {
        let mut parameters = ParameterSet::new();
        parameters.insert("lookback".into(), lookback);
        ParameterCandidate {
            parameters,
            sharpe_ratio: sharpe,
        }
    }

    fn best(lookback: f64) -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert("lookback".into(), lookback);
        p
    }

    #[test]
    fn flat_surface_keeps_best() {
        let candidates: Vec<_> = (0..8)
            .map(|i| candidate(10.0 + i as f64, 1.0 - i as f64 * 0.01))
            .collect();
        let choice = select_parameters(&best(10.0), &candidates, &OptimizationThresholds::default());
        assert_eq!(choice.source, ChoiceSource::Best);
        assert_eq!(choice.parameters["lookback"], 10.0);
    }

    #[test]
    fn peaked_surface_uses_top_quartile_median() {
        // top quartile of 8 = 2 points: (lookback 12, 2.0), (lookback 20, 0.8)
        let candidates = vec![
            candidate(12.0, 2.0),
            candidate(20.0, 0.8),
            candidate(30.0, 0.5),
            candidate(40.0, 0.4),
            candidate(50.0, 0.3),
            candidate(60.0, 0.2),
            candidate(70.0, 0.1),
            candidate(80.0, 0.0),
        ];
        let choice = select_parameters(&best(12.0), &candidates, &OptimizationThresholds::default());
        assert_eq!(choice.source, ChoiceSource::TopQuartileMedian);
        assert!((choice.spread.unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(choice.parameters["lookback"], 16.0);
    }

    #[test]
    fn too_few_candidates_keep_best() {
        let candidates = vec![candidate(12.0, 2.0), candidate(20.0, 0.1)];
        let choice = select_parameters(&best(12.0), &candidates, &OptimizationThresholds::default());
        assert_eq!(choice.source, ChoiceSource::Best);
        assert_eq!(choice.spread, None);
    }
}
