use super::GateError;
use crate::aggregate::RobustnessSummary;
use crate::decision::{Action, Decision, Evidence, Gate};
use crate::state::PhaseCounters;
use crate::thresholds::ThresholdConfig;

fn check_summary(summary: &RobustnessSummary) -> Result<(), GateError> {
    let fields = [
        ("mean_degradation", summary.mean_degradation),
        ("std_degradation", summary.std_degradation),
        ("fraction_overfit", summary.fraction_overfit),
        ("dsr", summary.dsr),
    ];
    for (field, value) in fields {
        if !value.is_finite() {
            return Err(GateError::MalformedSummary { field, value });
        }
    }
    if summary.runs_used == 0 {
        return Err(GateError::MalformedSummary {
            field: "runs_used",
            value: 0.0,
        });
    }
    Ok(())
}

/// Validation gate over a Monte Carlo robustness summary.
///
/// `history.validation_retries` counts RETRY_VALIDATION decisions already
/// taken; a retry is offered while it is below `limits.max_validation_retries`.
pub fn evaluate_validation(
    summary: &RobustnessSummary,
    thresholds: &ThresholdConfig,
    history: &PhaseCounters,
) -> Result<Decision, GateError> {
    check_summary(summary)?;

    let bands = &thresholds.degradation_thresholds;
    let v = &thresholds.validation;
    let mean = summary.mean_degradation;
    let std = summary.std_degradation;
    let decide = |action, rationale: String| {
        Ok(Decision::new(
            Gate::Validation,
            action,
            rationale,
            Evidence::Validation {
                summary: Box::new(summary.clone()),
            },
        ))
    };

    if mean > bands.abandon {
        return decide(
            Action::Abandon,
            format!(
                "mean degradation {:.1}% > {:.1}%; poor generalization",
                mean * 100.0,
                bands.abandon * 100.0
            ),
        );
    }
    if summary.fraction_overfit > v.unstable_run_fraction {
        return decide(
            Action::Abandon,
            format!(
                "unstable across samples: {:.0}% of runs degrade more than {:.0}%",
                summary.fraction_overfit * 100.0,
                bands.caution * 100.0
            ),
        );
    }
    if mean <= bands.acceptable && std <= v.max_degradation_std && summary.dsr >= v.min_dsr {
        return decide(
            Action::Deploy,
            format!(
                "low degradation {:.1}% (std {:.1}%), DSR {:.3} over {} runs",
                mean * 100.0,
                std * 100.0,
                summary.dsr,
                summary.runs_used
            ),
        );
    }
    if mean <= bands.caution {
        return decide(
            Action::ProceedWithCaution,
            format!(
                "moderate degradation {:.1}% (std {:.1}%), DSR {:.3}",
                mean * 100.0,
                std * 100.0,
                summary.dsr
            ),
        );
    }

    let max_retries = thresholds.limits.max_validation_retries;
    if history.validation_retries < max_retries {
        decide(
            Action::RetryValidation,
            format!(
                "degradation {:.1}% between caution and abandon bands; retry {} of {}",
                mean * 100.0,
                history.validation_retries + 1,
                max_retries
            ),
        )
    } else {
        decide(
            Action::Abandon,
            format!(
                "degradation {:.1}% still above caution band after {} retries",
                mean * 100.0,
                history.validation_retries
            ),
        )
    }
}
