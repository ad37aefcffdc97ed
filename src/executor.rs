//! Runs one attempt of one job through the state machine.
//!
//! The executor owns no session: the orchestrator leases a page, hands it
//! in, and decides from the returned report whether the session can go
//! back to the pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::answers::AnswerGenerator;
use crate::error::ErrorClass;
use crate::provider::BrowserPage;
use crate::recorder::OutcomeRecorder;
use crate::router::RouteEntry;
use crate::state_machine::{
    Attempt, CandidateProfile, Confirmation, IllegalTransition, Job, Outcome, StateMachine,
    StepState,
};
use crate::strategy::{FormStrategy, NavigationResult, StepResult, StrategyError, SubmitResult};

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocks workers at step boundaries while the campaign is paused.
#[derive(Clone)]
pub struct PauseGate(watch::Receiver<bool>);

impl PauseGate {
    /// A gate and the switch that controls it. `true` means paused.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    pub fn is_paused(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until unpaused. A dropped switch counts as unpaused.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|paused| !*paused).await;
    }
}

/// Why a run stopped before reaching a verdict of its own.
enum Stop {
    Cancelled,
    TimedOut,
    Strategy(StrategyError),
    Illegal(IllegalTransition),
}

impl From<IllegalTransition> for Stop {
    fn from(e: IllegalTransition) -> Self {
        Stop::Illegal(e)
    }
}

struct Finish {
    outcome: Outcome,
    reason: String,
    class: Option<ErrorClass>,
    confirmation: Option<Confirmation>,
}

impl Finish {
    fn new(outcome: Outcome, class: Option<ErrorClass>, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
            class,
            confirmation: None,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self::new(Outcome::Skipped, Some(ErrorClass::Policy), reason)
    }

    fn failed(class: ErrorClass, reason: impl Into<String>) -> Self {
        Self::new(Outcome::Failed, Some(class), reason)
    }

    fn pending(reason: impl Into<String>) -> Self {
        Self::new(Outcome::PendingReview, None, reason)
    }

    fn from_strategy(err: StrategyError) -> Self {
        match err.class() {
            ErrorClass::AntiBot => Self::new(Outcome::Skipped, Some(ErrorClass::AntiBot), err.to_string()),
            class => Self::failed(class, err.to_string()),
        }
    }
}

/// Step budget and pause gate for one run.
struct Budget {
    remaining: Duration,
    total: Duration,
    gate: PauseGate,
}

impl Budget {
    async fn checkpoint(&mut self, cancel: &CancellationToken) -> Result<(), Stop> {
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        if self.gate.is_paused() {
            debug!("paused at step boundary");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                _ = self.gate.wait() => {}
            }
        }
        Ok(())
    }

    /// Run `fut` against the remaining budget. Paused time is not charged.
    async fn run<T>(
        &mut self,
        cancel: &CancellationToken,
        fut: impl Future<Output = T>,
    ) -> Result<T, Stop> {
        let started = Instant::now();
        let out = tokio::select! {
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            r = tokio::time::timeout(self.remaining, fut) => r,
        };
        self.remaining = self.remaining.saturating_sub(started.elapsed());
        out.map_err(|_| Stop::TimedOut)
    }

    async fn spend<T>(
        &mut self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, StrategyError>>,
    ) -> Result<T, Stop> {
        self.run(cancel, fut).await?.map_err(Stop::Strategy)
    }
}

struct Run<'a> {
    page: &'a dyn BrowserPage,
    strategy: &'a dyn FormStrategy,
    job: &'a Job,
    profile: &'a CandidateProfile,
    cancel: &'a CancellationToken,
    max_steps: u32,
}

/// Everything one attempt needs besides the page.
pub struct AttemptContext<'a> {
    pub job: &'a Job,
    pub profile: &'a CandidateProfile,
    pub route: &'a RouteEntry,
    /// 1-based attempt number for this job.
    pub number: u32,
    pub cancel: &'a CancellationToken,
    pub gate: PauseGate,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub attempt: Attempt,
    /// Whether the session can be handed to another attempt.
    pub session_healthy: bool,
}

pub struct AttemptExecutor {
    answers: Arc<dyn AnswerGenerator>,
    recorder: Arc<dyn OutcomeRecorder>,
    auto_submit: bool,
}

impl AttemptExecutor {
    pub fn new(
        answers: Arc<dyn AnswerGenerator>,
        recorder: Arc<dyn OutcomeRecorder>,
        auto_submit: bool,
    ) -> Self {
        Self {
            answers,
            recorder,
            auto_submit,
        }
    }

    pub async fn execute(&self, ctx: AttemptContext<'_>, page: &dyn BrowserPage) -> ExecutionReport {
        let route = ctx.route;
        let mut attempt = Attempt::begin(&ctx.job.id, route.platform, ctx.number, page.id());
        let run = Run {
            page,
            strategy: route.strategy.as_ref(),
            job: ctx.job,
            profile: ctx.profile,
            cancel: ctx.cancel,
            max_steps: route.max_steps,
        };
        let mut budget = Budget {
            remaining: route.timeout,
            total: route.timeout,
            gate: ctx.gate,
        };
        debug!(job_id = %ctx.job.id, platform = %route.platform, attempt = ctx.number,
            strategy = route.strategy.name(), "attempt started");

        let finish = match self.drive(&run, &mut budget, &mut attempt).await {
            Ok(f) => f,
            Err(Stop::Cancelled) => Finish::new(Outcome::Aborted, None, "campaign aborted"),
            Err(Stop::TimedOut) => Finish::failed(
                ErrorClass::Transient,
                format!("timed out after {}s", budget.total.as_secs()),
            ),
            Err(Stop::Strategy(e)) => Finish::from_strategy(e),
            Err(Stop::Illegal(e)) => {
                error!(job_id = %ctx.job.id, error = %e, "state machine violation");
                Finish::failed(ErrorClass::Structural, format!("internal error: {e}"))
            }
        };

        let outcome = self.settle(&mut attempt, finish, page).await;
        let session_healthy = match outcome {
            Outcome::Submitted | Outcome::PendingReview | Outcome::Skipped => {
                attempt.error != Some(ErrorClass::AntiBot)
            }
            Outcome::Failed | Outcome::Aborted => false,
        };
        info!(
            job_id = %ctx.job.id,
            platform = %route.platform,
            attempt = ctx.number,
            outcome = %outcome,
            reason = %attempt.reason,
            "attempt finished"
        );
        ExecutionReport {
            attempt,
            session_healthy,
        }
    }

    async fn drive(
        &self,
        run: &Run<'_>,
        budget: &mut Budget,
        attempt: &mut Attempt,
    ) -> Result<Finish, Stop> {
        budget.checkpoint(run.cancel).await?;
        match budget
            .spend(run.cancel, run.strategy.navigate(run.page, run.job))
            .await?
        {
            NavigationResult::FormReached => StateMachine::advance(attempt, StepState::Navigated, None)?,
            NavigationResult::AlreadyApplied => return Ok(Finish::skipped("already applied")),
            NavigationResult::PositionClosed(r) => {
                return Ok(Finish::skipped(format!("position closed: {r}")));
            }
            NavigationResult::NoApplicationPath(r) => {
                return Ok(Finish::failed(
                    ErrorClass::Structural,
                    format!("no application path: {r}"),
                ));
            }
            NavigationResult::Challenge(r) => {
                return Ok(Finish::new(
                    Outcome::Skipped,
                    Some(ErrorClass::AntiBot),
                    format!("anti-bot challenge: {r}"),
                ));
            }
        }

        budget.checkpoint(run.cancel).await?;
        if let Some(f) = self.fill_page(run, budget, attempt, true).await? {
            return Ok(f);
        }

        let mut steps = 0u32;
        loop {
            budget.checkpoint(run.cancel).await?;
            if steps >= run.max_steps {
                return Ok(Finish::failed(ErrorClass::Structural, "step limit exceeded"));
            }
            steps += 1;
            match budget.spend(run.cancel, run.strategy.advance(run.page)).await? {
                StepResult::Advanced => {
                    StateMachine::advance(attempt, StepState::Advancing, Some(format!("step {steps}")))?;
                    if let Some(f) = self.fill_page(run, budget, attempt, false).await? {
                        return Ok(f);
                    }
                }
                StepResult::Review => StateMachine::advance(attempt, StepState::Reviewing, None)?,
                StepResult::Complete => break,
                StepResult::Terminated(r) => return Ok(Finish::failed(ErrorClass::Structural, r)),
            }
        }

        budget.checkpoint(run.cancel).await?;
        if !self.auto_submit {
            return match budget.spend(run.cancel, run.strategy.submit(run.page, false)).await? {
                SubmitResult::NoSubmitControl => {
                    Ok(Finish::failed(ErrorClass::Structural, "no submit control"))
                }
                SubmitResult::HeldForReview => {
                    Ok(Finish::pending("ready for review, auto-submit disabled"))
                }
                SubmitResult::Clicked => Ok(Finish::pending(
                    "submission state unknown: submit clicked while held for review",
                )),
            };
        }

        let submitted_from = budget
            .spend(run.cancel, async {
                run.page.current_url().await.map_err(StrategyError::from)
            })
            .await?;
        StateMachine::advance(attempt, StepState::Submitting, None)?;
        match budget.spend(run.cancel, run.strategy.submit(run.page, true)).await? {
            SubmitResult::Clicked => {}
            SubmitResult::HeldForReview => return Ok(Finish::pending("submission held for review")),
            SubmitResult::NoSubmitControl => {
                return Ok(Finish::failed(ErrorClass::Structural, "no submit control"));
            }
        }

        match budget
            .spend(run.cancel, run.strategy.verify_success(run.page, &submitted_from))
            .await?
        {
            Some(confirmation) => Ok(Finish {
                outcome: Outcome::Submitted,
                reason: format!("confirmed by {}", confirmation.indicator),
                class: None,
                confirmation: Some(confirmation),
            }),
            None => Ok(Finish::pending("submitted but no confirmation found")),
        }
    }

    /// Fill the current page and answer its open questions. `Some` ends the run.
    async fn fill_page(
        &self,
        run: &Run<'_>,
        budget: &mut Budget,
        attempt: &mut Attempt,
        first: bool,
    ) -> Result<Option<Finish>, Stop> {
        let fill = budget
            .spend(run.cancel, run.strategy.fill_fields(run.page, run.profile))
            .await?;
        if !fill.missing_required.is_empty() {
            return Ok(Some(Finish::failed(
                ErrorClass::Structural,
                format!("required field missing: {}", fill.missing_required.join(", ")),
            )));
        }
        if first {
            StateMachine::advance(
                attempt,
                StepState::Filled,
                Some(format!("{} fields", fill.filled.len())),
            )?;
        }

        let context = run.profile.context_summary();
        for question in &fill.open_questions {
            let answer = budget
                .run(run.cancel, self.answers.answer_question(&question.label, &context))
                .await?
                .ok()
                .filter(|a| !a.trim().is_empty());
            match answer {
                Some(a) => {
                    budget
                        .spend(run.cancel, run.strategy.fill_answer(run.page, question, &a))
                        .await?
                }
                None if question.required => {
                    return Ok(Some(Finish::new(
                        Outcome::PendingReview,
                        Some(ErrorClass::Policy),
                        format!("unanswered required question: {}", question.label),
                    )));
                }
                None => debug!(question = %question.label, "optional question left blank"),
            }
        }
        Ok(None)
    }

    /// Append the terminal step, capture evidence and seal the attempt.
    async fn settle(&self, attempt: &mut Attempt, finish: Finish, page: &dyn BrowserPage) -> Outcome {
        let mut finish = finish;

        // Once submit was clicked a retry could apply twice.
        if attempt.state() == StepState::Submitting && finish.outcome == Outcome::Failed {
            finish.outcome = Outcome::PendingReview;
            finish.reason = format!("submission state unknown: {}", finish.reason);
        }

        let to = finish.outcome.step_state();
        let pushed = if finish.class.is_none() && finish.outcome != Outcome::Aborted {
            let detail = finish
                .confirmation
                .as_ref()
                .map(|c| c.indicator.clone())
                .unwrap_or_else(|| finish.reason.clone());
            StateMachine::advance(attempt, to, Some(detail))
        } else {
            StateMachine::fail(attempt, to, finish.class, finish.reason.clone())
        };
        if let Err(e) = pushed {
            error!(attempt = %attempt.id, error = %e, "cannot record terminal step");
            finish = Finish::failed(ErrorClass::Structural, format!("{}; {e}", finish.reason));
            if let Err(e) = StateMachine::fail(attempt, StepState::Failed, finish.class, finish.reason.clone()) {
                error!(attempt = %attempt.id, error = %e, "attempt already terminal");
            }
        }

        if finish.outcome != Outcome::Aborted {
            self.capture(attempt, page).await;
        }

        attempt.error = finish.class;
        attempt.finish(finish.outcome, finish.reason, finish.confirmation);
        attempt.outcome.unwrap_or(Outcome::Failed)
    }

    async fn capture(&self, attempt: &mut Attempt, page: &dyn BrowserPage) {
        let label = attempt.state().to_string().to_lowercase();
        let bytes = match tokio::time::timeout(SCREENSHOT_TIMEOUT, page.screenshot()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(attempt = %attempt.id, error = %e, "screenshot failed");
                return;
            }
            Err(_) => {
                warn!(attempt = %attempt.id, "screenshot timed out");
                return;
            }
        };
        match self.recorder.store_evidence(&attempt.id, &label, &bytes).await {
            Ok(evidence) => attempt.evidence.push(evidence),
            Err(e) => warn!(attempt = %attempt.id, error = %e, "failed to store evidence"),
        }
    }
}
