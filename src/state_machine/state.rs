use std::fmt;

use serde::{Deserialize, Serialize};

use super::attempt::{Attempt, Step};
use crate::error::ErrorClass;

/// States of the per-attempt application state machine.
///
/// Each attempt flows through:
/// START → NAVIGATED → FILLED → {REVIEWING ⇄ ADVANCING}* → SUBMITTING → SUBMITTED
/// and may leave early through one of the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Start,
    Navigated,
    Filled,
    Advancing,
    Reviewing,
    Submitting,
    Submitted,
    PendingReview,
    Skipped,
    Failed,
    Aborted,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Submitted
                | StepState::PendingReview
                | StepState::Skipped
                | StepState::Failed
                | StepState::Aborted
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Start => "START",
            StepState::Navigated => "NAVIGATED",
            StepState::Filled => "FILLED",
            StepState::Advancing => "ADVANCING",
            StepState::Reviewing => "REVIEWING",
            StepState::Submitting => "SUBMITTING",
            StepState::Submitted => "SUBMITTED",
            StepState::PendingReview => "PENDING_REVIEW",
            StepState::Skipped => "SKIPPED",
            StepState::Failed => "FAILED",
            StepState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Rejected transition; indicates a bug in the caller, never a site problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: StepState,
    pub to: StepState,
}

/// Drives an `Attempt` through the state machine, appending one `Step` per
/// transition.
pub struct StateMachine;

impl StateMachine {
    /// Whether `to` may directly follow `from`.
    ///
    /// - `Start` may only navigate or end early (skip, fail, abort).
    /// - `Navigated` may only move to `Filled` or end early.
    /// - `Filled`, `Advancing` and `Reviewing` form the multi-page loop and may
    ///   hand over to `Submitting` or halt at `PendingReview`.
    /// - `Submitted` is only reachable from `Submitting`.
    /// - Terminal states accept nothing.
    pub fn is_legal(from: StepState, to: StepState) -> bool {
        use StepState::*;
        if from.is_terminal() {
            return false;
        }
        match (from, to) {
            (_, Failed) | (_, Aborted) => true,
            (Start, Navigated) | (Start, Skipped) => true,
            (Navigated, Filled) | (Navigated, Skipped) => true,
            (Filled | Advancing | Reviewing, Advancing | Reviewing | Submitting | PendingReview) => {
                true
            }
            (Filled | Advancing | Reviewing, Skipped) => true,
            (Submitting, Submitted) | (Submitting, PendingReview) => true,
            _ => false,
        }
    }

    /// Append a successful transition to `attempt`.
    pub fn advance(
        attempt: &mut Attempt,
        to: StepState,
        detail: Option<String>,
    ) -> Result<(), IllegalTransition> {
        Self::push(attempt, Step::ok(to, detail))
    }

    /// Append a failed (or otherwise unsuccessful) terminal transition.
    pub fn fail(
        attempt: &mut Attempt,
        to: StepState,
        class: Option<ErrorClass>,
        detail: impl Into<String>,
    ) -> Result<(), IllegalTransition> {
        Self::push(attempt, Step::failed(to, class, detail.into()))
    }

    fn push(attempt: &mut Attempt, step: Step) -> Result<(), IllegalTransition> {
        let from = attempt.state();
        if !Self::is_legal(from, step.state) {
            return Err(IllegalTransition { from, to: step.state });
        }
        attempt.steps.push(step);
        Ok(())
    }

    /// Check that a recorded step sequence is a valid path starting at `Start`.
    pub fn validate_path(steps: &[Step]) -> Result<(), IllegalTransition> {
        let mut current = StepState::Start;
        for (i, step) in steps.iter().enumerate() {
            if i == 0 && step.state == StepState::Start {
                continue;
            }
            if !Self::is_legal(current, step.state) {
                return Err(IllegalTransition { from: current, to: step.state });
            }
            current = step.state;
        }
        Ok(())
    }
}
