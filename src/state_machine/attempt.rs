use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::StepState;
use crate::error::ErrorClass;
use crate::platform::PlatformId;

/// Terminal result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Submitted and positively confirmed by `verify_success`.
    Submitted,
    /// Stopped before (or right after) submission for a human to confirm.
    PendingReview,
    /// Nothing to do: already applied, position closed.
    Skipped,
    Failed,
    /// Campaign cancelled while the attempt was in flight.
    Aborted,
}

impl Outcome {
    pub fn step_state(self) -> StepState {
        match self {
            Outcome::Submitted => StepState::Submitted,
            Outcome::PendingReview => StepState::PendingReview,
            Outcome::Skipped => StepState::Skipped,
            Outcome::Failed => StepState::Failed,
            Outcome::Aborted => StepState::Aborted,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Submitted => write!(f, "Submitted"),
            Outcome::PendingReview => write!(f, "PendingReview"),
            Outcome::Skipped => write!(f, "Skipped"),
            Outcome::Failed => write!(f, "Failed"),
            Outcome::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Positive evidence that the platform accepted the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Which indicator fired, e.g. "text: thank you" or "url: /confirmation".
    pub indicator: String,
    pub confirmation_id: Option<String>,
}

/// Reference to a captured artifact (screenshot) stored by the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub label: String,
    pub location: String,
    pub captured_at: DateTime<Utc>,
}

/// One state-machine transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub state: StepState,
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<ErrorClass>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Step {
    pub fn ok(state: StepState, detail: Option<String>) -> Self {
        Self {
            state,
            at: Utc::now(),
            success: true,
            error: None,
            detail,
        }
    }

    pub fn failed(state: StepState, error: Option<ErrorClass>, detail: String) -> Self {
        Self {
            state,
            at: Utc::now(),
            success: false,
            error,
            detail: Some(detail),
        }
    }
}

/// One execution of the state machine for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub job_id: String,
    pub platform: PlatformId,
    /// 1-based attempt number for this job.
    pub number: u32,
    pub session_id: String,
    pub steps: Vec<Step>,
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub error: Option<ErrorClass>,
    #[serde(default)]
    pub confirmation: Option<Confirmation>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn begin(
        job_id: impl Into<String>,
        platform: PlatformId,
        number: u32,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            platform,
            number,
            session_id: session_id.into(),
            steps: vec![Step::ok(StepState::Start, None)],
            outcome: None,
            reason: String::new(),
            error: None,
            confirmation: None,
            evidence: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Current state: the state of the last recorded step.
    pub fn state(&self) -> StepState {
        self.steps.last().map(|s| s.state).unwrap_or(StepState::Start)
    }

    /// Seal the attempt. A `Submitted` outcome without a confirmation is
    /// downgraded to `PendingReview`: absence of proof is never success.
    pub fn finish(
        &mut self,
        outcome: Outcome,
        reason: impl Into<String>,
        confirmation: Option<Confirmation>,
    ) {
        let outcome = match (outcome, &confirmation) {
            (Outcome::Submitted, None) => Outcome::PendingReview,
            (o, _) => o,
        };
        self.outcome = Some(outcome);
        self.reason = reason.into();
        self.confirmation = confirmation;
        if self.error.is_none() {
            self.error = self.steps.iter().rev().find_map(|s| s.error);
        }
        self.finished_at = Some(Utc::now());
    }

    /// True when the attempt is Submitted, carries a confirmation and its
    /// step path passes through SUBMITTING → SUBMITTED.
    pub fn has_verified_submission(&self) -> bool {
        if self.outcome != Some(Outcome::Submitted) || self.confirmation.is_none() {
            return false;
        }
        let n = self.steps.len();
        n >= 2
            && self.steps[n - 1].state == StepState::Submitted
            && self.steps[n - 1].success
            && self.steps[n - 2].state == StepState::Submitting
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_starts_at_start() {
        let a = Attempt::begin("j", PlatformId::Lever, 1, "s");
        assert_eq!(a.state(), StepState::Start);
        assert_eq!(a.steps.len(), 1);
        assert!(a.outcome.is_none());
        assert!(a.duration_ms().is_none());
    }

    #[test]
    fn unconfirmed_submission_is_downgraded() {
        let mut a = Attempt::begin("j", PlatformId::Lever, 1, "s");
        a.finish(Outcome::Submitted, "clicked submit", None);
        assert_eq!(a.outcome, Some(Outcome::PendingReview));
        assert!(!a.has_verified_submission());
    }

    #[test]
    fn finish_picks_up_last_error_class() {
        let mut a = Attempt::begin("j", PlatformId::Lever, 1, "s");
        a.steps.push(Step::failed(
            StepState::Failed,
            Some(ErrorClass::Transient),
            "timeout".into(),
        ));
        a.finish(Outcome::Failed, "timeout", None);
        assert_eq!(a.error, Some(ErrorClass::Transient));
        assert!(a.finished_at.is_some());
    }

    #[test]
    fn attempt_serializes_to_json() {
        let mut a = Attempt::begin("job-9", PlatformId::Workday, 2, "s-1");
        a.finish(Outcome::Skipped, "already applied", None);
        let json = serde_json::to_string(&a).unwrap();
        let parsed: Attempt = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, "job-9");
        assert_eq!(parsed.platform, PlatformId::Workday);
        assert_eq!(parsed.outcome, Some(Outcome::Skipped));
        assert_eq!(parsed.reason, "already applied");
    }
}
