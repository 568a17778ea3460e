//! Gate evaluators.
//!
//! Each gate is a pure function of `(metrics, thresholds, history)` that
//! returns a [`Decision`](crate::decision::Decision). Rules are evaluated
//! top to bottom and the first match wins. ABANDON and ESCALATE are
//! ordinary outcomes; a gate only returns `Err` for malformed input.

mod backtest;
mod optimization;
mod validation;

pub use backtest::evaluate_backtest;
pub use optimization::{
    evaluate_optimization, relative_improvement, select_parameters, ChoiceSource, ParameterChoice,
};
pub use validation::evaluate_validation;

use thiserror::Error;

use crate::metrics::PerformanceMetrics;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GateError {
    #[error("malformed metrics: {field} = {value}")]
    MalformedMetrics { field: &'static str, value: f64 },

    #[error("malformed robustness summary: {field} = {value}")]
    MalformedSummary { field: &'static str, value: f64 },
}

fn check_metrics(metrics: &PerformanceMetrics) -> Result<(), GateError> {
    match metrics.malformed_field() {
        Some((field, value)) => Err(GateError::MalformedMetrics { field, value }),
        None => Ok(()),
    }
}
