//! Hypothesis state machine.
//!
//! ```text
//! research -> implementation -> backtest -> { optimization | validation | abandoned }
//!                                optimization -> { validation | abandoned }
//!                                validation -> { complete | abandoned }
//! ```
//!
//! Gate transitions are driven only by [`Decision`] values. Before every gate
//! the iteration and cost ceilings are checked; a breach forces ABANDON no
//! matter what the gate would have said. ESCALATE keeps the hypothesis in
//! its phase with a pending review; nothing else is accepted until a human
//! resolution is recorded. Terminal phases accept no further transitions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use hypolab_core::{
    evaluate_backtest, evaluate_optimization, evaluate_validation, select_parameters, Action,
    ChoiceSource, Decision, DecisionRecord, Evidence, Gate, GateError, HypothesisState,
    ParameterCandidate, ParameterSet, PendingReview, PerformanceMetrics, Phase, PhaseCounters,
    RobustnessSummary, StateError, ThresholdConfig,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MachineError {
    #[error("hypothesis is {phase}; no further transitions")]
    Terminal { phase: Phase },

    #[error("expected phase {expected}, hypothesis is in {actual}")]
    WrongPhase { expected: Phase, actual: Phase },

    #[error("escalation from the {gate:?} gate awaits review")]
    AwaitingReview { gate: Gate },

    #[error("no escalation is pending")]
    NoPendingReview,

    #[error("{action} is not a valid transition from {from}")]
    InvalidTransition { from: Phase, action: Action },

    #[error("optimization gate needs baseline backtest metrics")]
    MissingBaseline,

    #[error(transparent)]
    Gate(#[from] GateError),
}

/// What the caller should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    RunBacktest,
    Optimize,
    /// Walk-forward with the fixed baseline parameters.
    ValidateBaseline,
    /// Walk-forward re-optimizing on every train window.
    ValidateOptimized,
    AwaitReview,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: DecisionRecord,
    pub next_step: NextStep,
}

pub struct HypothesisMachine {
    state: HypothesisState,
}

impl HypothesisMachine {
    /// Start a new hypothesis in the research phase.
    pub fn start(
        hypothesis_id: impl Into<String>,
        thresholds: ThresholdConfig,
        baseline_parameters: ParameterSet,
    ) -> Self {
        Self {
            state: HypothesisState::new(hypothesis_id, thresholds, baseline_parameters, Utc::now()),
        }
    }

    /// Resume from a snapshot.
    pub fn resume(state: HypothesisState) -> Self {
        Self { state }
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        Ok(Self::resume(HypothesisState::from_json(json)?))
    }

    pub fn state(&self) -> &HypothesisState {
        &self.state
    }

    pub fn into_state(self) -> HypothesisState {
        self.state
    }

    pub fn snapshot(&self) -> Result<String, StateError> {
        self.state.to_json()
    }

    /// The step the caller should take from the current state.
    pub fn next_step(&self) -> NextStep {
        if self.state.pending_review.is_some() {
            return NextStep::AwaitReview;
        }
        match self.state.phase {
            Phase::Research | Phase::Implementation | Phase::Backtest => NextStep::RunBacktest,
            Phase::Optimization => NextStep::Optimize,
            Phase::Validation => self.validation_step(),
            Phase::Complete | Phase::Abandoned => NextStep::Done,
        }
    }

    /// Add collaborator cost to the running total.
    pub fn charge(&mut self, cost: f64) {
        if cost > 0.0 {
            self.state.cumulative_cost += cost;
        }
    }

    // ─── Pre-gate phases ─────────────────────────────────────────────

    pub fn begin_implementation(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Research)?;
        self.state.phase = Phase::Implementation;
        Ok(())
    }

    /// Strategy is implemented; the backtest gate is next.
    pub fn begin_backtest(&mut self) -> Result<(), MachineError> {
        self.ensure_open()?;
        match self.state.phase {
            Phase::Research | Phase::Implementation => {
                self.state.phase = Phase::Backtest;
                Ok(())
            }
            actual => Err(MachineError::WrongPhase {
                expected: Phase::Implementation,
                actual,
            }),
        }
    }

    // ─── Gates ───────────────────────────────────────────────────────

    pub fn submit_backtest(&mut self, metrics: PerformanceMetrics) -> Result<Transition, MachineError> {
        self.expect_phase(Phase::Backtest)?;
        let before = self.state.counters.clone();
        self.state.counters.backtest_runs += 1;
        self.state.counters.total_iterations += 1;

        if let Some(transition) = self.enforce_budget() {
            return Ok(transition);
        }
        let evaluated = evaluate_backtest(&metrics, &self.state.thresholds, &self.state.counters);
        let decision = self.gate_result(before, evaluated)?;
        self.state.baseline_metrics = Some(metrics);
        if decision.action == Action::ProceedToValidation {
            self.state.validate_with_baseline = true;
        }
        self.apply(decision)
    }

    /// Submit the optimizer's best point. `candidates` feeds the
    /// parameter-sensitivity check and may be empty.
    pub fn submit_optimization(
        &mut self,
        best_parameters: ParameterSet,
        optimized: PerformanceMetrics,
        candidates: &[ParameterCandidate],
    ) -> Result<Transition, MachineError> {
        self.expect_phase(Phase::Optimization)?;
        let baseline = self
            .state
            .baseline_metrics
            .clone()
            .ok_or(MachineError::MissingBaseline)?;
        let before = self.state.counters.clone();
        self.state.counters.optimization_attempts += 1;
        self.state.counters.total_iterations += 1;

        if let Some(transition) = self.enforce_budget() {
            return Ok(transition);
        }
        let evaluated =
            evaluate_optimization(&baseline, &optimized, &self.state.thresholds, &self.state.counters);
        let decision = self.gate_result(before, evaluated)?;

        match decision.action {
            // An escalated set is kept so an approving review can validate it.
            Action::ProceedToValidation | Action::Escalate => {
                let choice = select_parameters(
                    &best_parameters,
                    candidates,
                    &self.state.thresholds.optimization,
                );
                if choice.source == ChoiceSource::TopQuartileMedian {
                    info!(
                        hypothesis = %self.state.hypothesis_id,
                        spread = choice.spread,
                        "Sharpe sensitive to parameters, using top-quartile median"
                    );
                }
                self.state.optimized_parameters = Some(choice.parameters);
                if decision.action == Action::ProceedToValidation {
                    self.state.validate_with_baseline = false;
                }
            }
            Action::UseBaselineParams => {
                self.state.optimized_parameters = None;
                self.state.validate_with_baseline = true;
            }
            _ => {}
        }
        self.apply(decision)
    }

    pub fn submit_validation(&mut self, summary: &RobustnessSummary) -> Result<Transition, MachineError> {
        self.expect_phase(Phase::Validation)?;
        let before = self.state.counters.clone();
        self.state.counters.validation_passes += 1;
        self.state.counters.total_iterations += 1;

        if let Some(transition) = self.enforce_budget() {
            return Ok(transition);
        }
        let evaluated = evaluate_validation(summary, &self.state.thresholds, &self.state.counters);
        let decision = self.gate_result(before, evaluated)?;
        if decision.action == Action::RetryValidation {
            self.state.counters.validation_retries += 1;
        }
        self.apply(decision)
    }

    /// A validation pass raised a systematic failure; escalate.
    pub fn record_systematic_failure(
        &mut self,
        failed: usize,
        attempted: usize,
    ) -> Result<Transition, MachineError> {
        self.expect_phase(Phase::Validation)?;
        self.state.counters.validation_passes += 1;
        self.state.counters.total_iterations += 1;

        if let Some(transition) = self.enforce_budget() {
            return Ok(transition);
        }
        self.apply(Decision::systematic_failure(failed, attempted))
    }

    /// Record a human resolution of a pending escalation.
    ///
    /// `action` is routed like a gate decision from the current phase.
    pub fn resolve_review(
        &mut self,
        action: Action,
        reviewer: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<Transition, MachineError> {
        self.ensure_not_terminal()?;
        let pending = self
            .state
            .pending_review
            .clone()
            .ok_or(MachineError::NoPendingReview)?;
        if action == Action::Escalate {
            return Err(MachineError::InvalidTransition {
                from: self.state.phase,
                action,
            });
        }
        // Reject before clearing the review.
        self.route(action)?;

        let note = note.into();
        let rationale = if note.is_empty() {
            format!("review of {:?} escalation: {action}", pending.gate)
        } else {
            format!("review of {:?} escalation: {action} ({note})", pending.gate)
        };
        let decision = Decision::new(
            Gate::Review,
            action,
            rationale,
            Evidence::Review {
                reviewer: reviewer.into(),
            },
        );
        match action {
            Action::UseBaselineParams => self.state.validate_with_baseline = true,
            Action::ProceedToValidation if self.state.phase == Phase::Backtest => {
                self.state.validate_with_baseline = true
            }
            Action::ProceedToValidation if self.state.phase == Phase::Optimization => {
                self.state.validate_with_baseline = false
            }
            _ => {}
        }
        self.state.pending_review = None;
        self.apply(decision)
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn ensure_not_terminal(&self) -> Result<(), MachineError> {
        if self.state.is_terminal() {
            return Err(MachineError::Terminal {
                phase: self.state.phase,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MachineError> {
        self.ensure_not_terminal()?;
        if let Some(pending) = &self.state.pending_review {
            return Err(MachineError::AwaitingReview { gate: pending.gate });
        }
        Ok(())
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), MachineError> {
        self.ensure_open()?;
        if self.state.phase != expected {
            return Err(MachineError::WrongPhase {
                expected,
                actual: self.state.phase,
            });
        }
        Ok(())
    }

    fn enforce_budget(&mut self) -> Option<Transition> {
        let breach = self.state.check_budget()?;
        warn!(
            hypothesis = %self.state.hypothesis_id,
            %breach,
            "budget exhausted, abandoning"
        );
        let record = self
            .state
            .record_transition(Decision::budget_exhausted(breach), Phase::Abandoned, Utc::now())
            .clone();
        Some(Transition {
            record,
            next_step: NextStep::Done,
        })
    }

    /// Malformed gate input leaves the counters as they were.
    fn gate_result(
        &mut self,
        before: PhaseCounters,
        evaluated: Result<Decision, GateError>,
    ) -> Result<Decision, MachineError> {
        evaluated.map_err(|err| {
            warn!(hypothesis = %self.state.hypothesis_id, %err, "gate rejected its input");
            self.state.counters = before;
            MachineError::Gate(err)
        })
    }

    fn validation_step(&self) -> NextStep {
        if self.state.validate_with_baseline {
            NextStep::ValidateBaseline
        } else {
            NextStep::ValidateOptimized
        }
    }

    /// Routing table: where `action` leads from the current phase.
    fn route(&self, action: Action) -> Result<(Phase, NextStep), MachineError> {
        let from = self.state.phase;
        let invalid = MachineError::InvalidTransition { from, action };
        let route = match (from, action) {
            (_, Action::Abandon) => (Phase::Abandoned, NextStep::Done),
            (_, Action::Escalate) => (from, NextStep::AwaitReview),
            (Phase::Backtest | Phase::Optimization, Action::ProceedToOptimization) => {
                (Phase::Optimization, NextStep::Optimize)
            }
            (Phase::Backtest, Action::ProceedToValidation) => {
                (Phase::Validation, NextStep::ValidateBaseline)
            }
            (Phase::Optimization, Action::ProceedToValidation) => {
                (Phase::Validation, NextStep::ValidateOptimized)
            }
            (Phase::Optimization, Action::UseBaselineParams) => {
                (Phase::Validation, NextStep::ValidateBaseline)
            }
            (Phase::Validation, Action::Deploy | Action::ProceedWithCaution) => {
                (Phase::Complete, NextStep::Done)
            }
            (Phase::Validation, Action::RetryValidation) => {
                (Phase::Validation, self.validation_step())
            }
            _ => return Err(invalid),
        };
        Ok(route)
    }

    fn apply(&mut self, decision: Decision) -> Result<Transition, MachineError> {
        let (to, mut next_step) = self.route(decision.action)?;
        let from = self.state.phase;

        if decision.action == Action::Escalate {
            self.state.pending_review = Some(PendingReview {
                gate: decision.gate,
                decision_sequence: self.state.decisions().len(),
                rationale: decision.rationale.clone(),
            });
        }

        info!(
            hypothesis = %self.state.hypothesis_id,
            %from,
            %to,
            action = %decision.action,
            rationale = %decision.rationale,
            "phase transition"
        );
        let record = self
            .state
            .record_transition(decision, to, Utc::now())
            .clone();

        if to == Phase::Validation {
            next_step = self.validation_step();
        }
        Ok(Transition { record, next_step })
    }
}
