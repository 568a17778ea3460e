use super::{check_metrics, GateError};
use crate::decision::{Action, Decision, Evidence, Gate};
use crate::metrics::PerformanceMetrics;
use crate::state::PhaseCounters;
use crate::thresholds::ThresholdConfig;

/// Backtest gate.
///
/// Overfitting signals are checked before the viability floor, so a run
/// with zero trades escalates (likely a configuration bug) instead of
/// abandoning the hypothesis.
pub fn evaluate_backtest(
    metrics: &PerformanceMetrics,
    thresholds: &ThresholdConfig,
    _history: &PhaseCounters,
) -> Result<Decision, GateError> {
    check_metrics(metrics)?;

    let signals = &thresholds.overfitting_signals;
    let viable = &thresholds.minimum_viable;
    let sharpe = metrics.sharpe_ratio;
    let decide = |action, rationale: String| {
        Ok(Decision::new(
            Gate::Backtest,
            action,
            rationale,
            Evidence::Backtest {
                metrics: metrics.clone(),
            },
        ))
    };

    if sharpe > signals.too_perfect_sharpe {
        return decide(
            Action::Escalate,
            format!(
                "Sharpe {sharpe:.2} implausibly high (> {:.2}); check for look-ahead or data errors",
                signals.too_perfect_sharpe
            ),
        );
    }
    if metrics.total_trades < signals.too_few_trades {
        return decide(
            Action::Escalate,
            format!(
                "too few trades to trust the Sharpe estimate ({} < {})",
                metrics.total_trades, signals.too_few_trades
            ),
        );
    }
    if metrics.win_rate > signals.win_rate_too_high {
        return decide(
            Action::Escalate,
            format!(
                "win rate {:.1}% implausibly high (> {:.1}%)",
                metrics.win_rate * 100.0,
                signals.win_rate_too_high * 100.0
            ),
        );
    }

    let mut failures = Vec::new();
    if sharpe < viable.sharpe_ratio {
        failures.push(format!("Sharpe {sharpe:.2} < {:.2}", viable.sharpe_ratio));
    }
    if metrics.max_drawdown > viable.max_drawdown {
        failures.push(format!(
            "drawdown {:.1}% > {:.1}%",
            metrics.max_drawdown * 100.0,
            viable.max_drawdown * 100.0
        ));
    }
    if metrics.total_trades < viable.min_trades {
        failures.push(format!("trades {} < {}", metrics.total_trades, viable.min_trades));
    }
    if !failures.is_empty() {
        return decide(
            Action::Abandon,
            format!("below minimum viable: {}", failures.join(", ")),
        );
    }

    let production = &thresholds.production_ready;
    if sharpe >= production.sharpe_ratio && metrics.max_drawdown <= production.max_drawdown {
        return decide(
            Action::ProceedToValidation,
            format!(
                "production-ready baseline (Sharpe {sharpe:.2}, drawdown {:.1}%); skip optimization",
                metrics.max_drawdown * 100.0
            ),
        );
    }
    if sharpe >= thresholds.optimization_worthy.sharpe_ratio {
        return decide(
            Action::ProceedToOptimization,
            format!("Sharpe {sharpe:.2} worth optimizing"),
        );
    }
    decide(
        Action::ProceedToOptimization,
        format!("marginal Sharpe {sharpe:.2}; optimize before giving up"),
    )
}
