//! Campaign runner: schedules jobs across platforms under the pool, rate
//! limiter and circuit breakers, and drives each through the retry
//! coordinator and the attempt executor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{Admission, CircuitBreakerRegistry};
use crate::error::ErrorClass;
use crate::executor::{AttemptContext, AttemptExecutor, PauseGate};
use crate::limiter::RateLimiterRegistry;
use crate::platform::PlatformId;
use crate::pool::SessionPool;
use crate::recorder::OutcomeRecorder;
use crate::retry::{Disposition, RetryOutcome, RetryPolicy, run_with_retry};
use crate::router::{PlatformRouter, RouteEntry};
use crate::state_machine::{
    Attempt, CandidateProfile, Job, Outcome, PriorityClass, StateMachine, StepState,
};

/// Smallest deferral applied to a job pushed back by admission control.
const MIN_DEFERRAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub max_concurrency: usize,
    /// Hard ceiling on distinct jobs dispatched in this campaign.
    pub max_total_applications: usize,
    pub retry: RetryPolicy,
    /// Delay before a job bounced by pool backpressure is tried again.
    pub requeue_delay: Duration,
    /// Circuit-open deferrals a job may take before it is skipped.
    pub max_deferrals: u32,
    /// How far back to look when seeding circuit breakers.
    pub history_window: Duration,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_total_applications: 50,
            retry: RetryPolicy::default(),
            requeue_delay: Duration::from_secs(5),
            max_deferrals: 3,
            history_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignState::Idle => "idle",
            CampaignState::Running => "running",
            CampaignState::Paused => "paused",
            CampaignState::Completed => "completed",
            CampaignState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

struct ControlInner {
    state: watch::Sender<CampaignState>,
    pause: watch::Sender<bool>,
    gate: PauseGate,
    cancel: CancellationToken,
}

/// Cloneable handle to pause, resume or abort a running campaign.
#[derive(Clone)]
pub struct CampaignControl {
    inner: Arc<ControlInner>,
}

impl Default for CampaignControl {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CampaignState::Idle);
        let (pause, gate) = PauseGate::channel();
        Self {
            inner: Arc::new(ControlInner {
                state,
                pause,
                gate,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> CampaignState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CampaignState> {
        self.inner.state.subscribe()
    }

    /// Running → Paused. In-flight attempts stop at their next step boundary.
    pub fn pause(&self) -> bool {
        let changed = self.transition(CampaignState::Running, CampaignState::Paused);
        if changed {
            self.inner.pause.send_replace(true);
            info!("campaign paused");
        }
        changed
    }

    /// Paused → Running.
    pub fn resume(&self) -> bool {
        let changed = self.transition(CampaignState::Paused, CampaignState::Running);
        if changed {
            self.inner.pause.send_replace(false);
            info!("campaign resumed");
        }
        changed
    }

    /// Cancel everything. In-flight attempts finish as Aborted.
    pub fn abort(&self) {
        if !self.inner.cancel.is_cancelled() {
            warn!("campaign abort requested");
        }
        self.inner.cancel.cancel();
        self.inner.pause.send_replace(false);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn gate(&self) -> PauseGate {
        self.inner.gate.clone()
    }

    fn transition(&self, from: CampaignState, to: CampaignState) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    fn set_state(&self, to: CampaignState) {
        self.inner.state.send_replace(to);
    }
}

/// Final word on one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub label: String,
    pub platform: PlatformId,
    pub outcome: Outcome,
    pub reason: String,
    /// Attempts that consumed a retry.
    pub attempts: u32,
    pub confirmation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlatformStats {
    pub submitted: u32,
    pub pending_review: u32,
    pub skipped: u32,
    pub failed: u32,
    pub aborted: u32,
    pub circuit_rejections: u32,
    pub rate_limited: u32,
}

impl PlatformStats {
    pub fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Submitted => self.submitted += 1,
            Outcome::PendingReview => self.pending_review += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Aborted => self.aborted += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub state: CampaignState,
    pub results: Vec<JobResult>,
    pub per_platform: BTreeMap<String, PlatformStats>,
    pub dispatched: usize,
    /// Jobs never dispatched because of the ceiling or an abort.
    pub undispatched: usize,
    pub circuit_rejections: u32,
    pub rate_limited: u32,
    pub pool_backpressure: u32,
}

impl CampaignSummary {
    fn new() -> Self {
        Self {
            state: CampaignState::Idle,
            results: Vec::new(),
            per_platform: BTreeMap::new(),
            dispatched: 0,
            undispatched: 0,
            circuit_rejections: 0,
            rate_limited: 0,
            pool_backpressure: 0,
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn result_for(&self, job_id: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.job_id == job_id)
    }

    fn platform(&mut self, platform: PlatformId) -> &mut PlatformStats {
        self.per_platform.entry(platform.to_string()).or_default()
    }

    fn record(&mut self, result: JobResult) {
        self.platform(result.platform).tally(result.outcome);
        self.results.push(result);
    }
}

/// Progress notifications for a UI.
#[derive(Debug, Clone)]
pub enum CampaignEvent {
    Queued { total: usize },
    Dispatched { job_id: String, label: String, platform: PlatformId },
    Deferred { job_id: String, reason: String },
    Finished(JobResult),
}

struct Queued {
    job: Arc<Job>,
    platform: PlatformId,
    priority: PriorityClass,
    seq: u64,
    not_before: Instant,
    attempts_used: u32,
    deferrals: u32,
    dispatched: bool,
}

enum Pick {
    Dispatch(Queued, bool),
    Wait(Option<Instant>),
}

enum JobDone {
    Finished(JobResult),
    Requeue(Queued),
}

/// What the dispatcher remembers about a running worker, for when it crashes.
struct InFlight {
    job: Arc<Job>,
    platform: PlatformId,
    attempts_used: u32,
    probe: bool,
}

/// Why one attempt did not produce a final answer.
enum AttemptFailure {
    Backpressure(String),
    Failed(Attempt),
}

impl AttemptFailure {
    fn disposition(&self) -> Disposition {
        match self {
            AttemptFailure::Backpressure(_) => Disposition::Backpressure,
            AttemptFailure::Failed(a) => Disposition::from(a.error.unwrap_or(ErrorClass::Structural)),
        }
    }
}

struct Shared {
    router: Arc<PlatformRouter>,
    pool: Arc<SessionPool>,
    limiter: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    executor: Arc<AttemptExecutor>,
    recorder: Arc<dyn OutcomeRecorder>,
    config: CampaignConfig,
    control: CampaignControl,
    events: Option<mpsc::UnboundedSender<CampaignEvent>>,
}

impl Shared {
    fn emit(&self, event: CampaignEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct CampaignRunner {
    shared: Arc<Shared>,
}

impl CampaignRunner {
    pub fn new(
        router: Arc<PlatformRouter>,
        pool: Arc<SessionPool>,
        limiter: Arc<RateLimiterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        executor: Arc<AttemptExecutor>,
        recorder: Arc<dyn OutcomeRecorder>,
        config: CampaignConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                router,
                pool,
                limiter,
                breakers,
                executor,
                recorder,
                config,
                control: CampaignControl::new(),
                events: None,
            }),
        }
    }

    /// Use an externally created control handle (e.g. wired to Ctrl-C).
    pub fn with_control(mut self, control: CampaignControl) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.control = control;
        }
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<CampaignEvent>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.events = Some(tx);
        }
        self
    }

    pub fn control(&self) -> CampaignControl {
        self.shared.control.clone()
    }

    pub async fn run(&self, jobs: Vec<Job>, profile: CandidateProfile) -> CampaignSummary {
        let shared = &self.shared;
        let control = &shared.control;
        let cancel = control.cancel_token().clone();
        let profile = Arc::new(profile);
        let mut summary = CampaignSummary::new();

        let now = Instant::now();
        let mut queue: Vec<Queued> = jobs
            .into_iter()
            .enumerate()
            .map(|(seq, job)| {
                let platform = shared.router.resolve_job(&job);
                Queued {
                    job: Arc::new(job),
                    platform,
                    priority: PriorityClass::for_platform(platform),
                    seq: seq as u64,
                    not_before: now,
                    attempts_used: 0,
                    deferrals: 0,
                    dispatched: false,
                }
            })
            .collect();
        shared.emit(CampaignEvent::Queued { total: queue.len() });

        self.seed_breakers(&queue).await;
        if control.state() == CampaignState::Idle {
            control.set_state(CampaignState::Running);
        }
        info!(jobs = queue.len(), max_concurrency = shared.config.max_concurrency, "campaign started");

        let semaphore = Arc::new(Semaphore::new(shared.config.max_concurrency.max(1)));
        let mut workers: JoinSet<JobDone> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, InFlight> = HashMap::new();
        let mut dispatched_ids: HashSet<String> = HashSet::new();
        let mut state_rx = control.subscribe();

        loop {
            while let Some(done) = workers.try_join_next_with_id() {
                self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
            }
            if cancel.is_cancelled() {
                break;
            }

            if control.state() == CampaignState::Paused {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = state_rx.changed() => {}
                    Some(done) = workers.join_next_with_id(), if !workers.is_empty() => {
                        self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
                    }
                }
                continue;
            }

            if dispatched_ids.len() >= shared.config.max_total_applications {
                let before = queue.len();
                queue.retain(|q| q.dispatched);
                let dropped = before - queue.len();
                if dropped > 0 {
                    info!(dropped, "application ceiling reached");
                    summary.undispatched += dropped;
                }
            }

            if queue.is_empty() {
                if workers.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    Some(done) = workers.join_next_with_id() => {
                        self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
                    }
                }
                continue;
            }

            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    Some(done) = workers.join_next_with_id() => {
                        self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
                    }
                }
                continue;
            };

            match self.pick(&mut queue, Instant::now(), &mut summary) {
                Pick::Dispatch(mut entry, probe) => {
                    if !entry.dispatched {
                        entry.dispatched = true;
                        dispatched_ids.insert(entry.job.id.clone());
                        summary.dispatched += 1;
                    }
                    shared.emit(CampaignEvent::Dispatched {
                        job_id: entry.job.id.clone(),
                        label: entry.job.label(),
                        platform: entry.platform,
                    });
                    debug!(job_id = %entry.job.id, platform = %entry.platform, probe, "dispatching");
                    let info = InFlight {
                        job: entry.job.clone(),
                        platform: entry.platform,
                        attempts_used: entry.attempts_used,
                        probe,
                    };
                    let worker = Arc::clone(shared);
                    let profile = Arc::clone(&profile);
                    let handle = workers.spawn(async move {
                        let _permit = permit;
                        run_job(worker, entry, probe, profile).await
                    });
                    in_flight.insert(handle.id(), info);
                }
                Pick::Wait(until) => {
                    drop(permit);
                    let until = until.unwrap_or_else(|| Instant::now() + shared.config.requeue_delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = state_rx.changed() => {}
                        _ = tokio::time::sleep_until(until) => {}
                        Some(done) = workers.join_next_with_id(), if !workers.is_empty() => {
                            self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
                        }
                    }
                }
            }
        }

        while let Some(done) = workers.join_next_with_id().await {
            self.handle_done(done, &mut in_flight, &mut queue, &mut summary);
        }
        summary.undispatched += queue.len();

        let final_state = if cancel.is_cancelled() {
            CampaignState::Aborted
        } else {
            CampaignState::Completed
        };
        control.set_state(final_state);
        summary.state = final_state;
        info!(
            state = %final_state,
            dispatched = summary.dispatched,
            submitted = summary.count(Outcome::Submitted),
            pending_review = summary.count(Outcome::PendingReview),
            failed = summary.count(Outcome::Failed),
            "campaign finished"
        );
        summary
    }

    async fn seed_breakers(&self, queue: &[Queued]) {
        let platforms: HashSet<PlatformId> = queue.iter().map(|q| q.platform).collect();
        for platform in platforms {
            match self
                .shared
                .recorder
                .query_recent_outcomes(platform, self.shared.config.history_window)
                .await
            {
                Ok(history) => self.shared.breakers.seed_from_history(platform, &history),
                Err(e) => warn!(%platform, error = %e, "could not read outcome history"),
            }
        }
    }

    /// Choose the next job to dispatch, pushing back any the breaker or
    /// limiter will not admit right now.
    fn pick(&self, queue: &mut Vec<Queued>, now: Instant, summary: &mut CampaignSummary) -> Pick {
        let shared = &self.shared;
        loop {
            let next = queue
                .iter()
                .enumerate()
                .filter(|(_, q)| q.not_before <= now)
                .min_by_key(|(_, q)| (q.priority, q.seq))
                .map(|(i, _)| i);
            let Some(idx) = next else {
                return Pick::Wait(queue.iter().map(|q| q.not_before).min());
            };
            let platform = queue[idx].platform;

            let admission = shared.breakers.try_admit(platform);
            if let Admission::AwaitingProbe { retry_after } = admission {
                summary.circuit_rejections += 1;
                summary.platform(platform).circuit_rejections += 1;
                let entry = &mut queue[idx];
                entry.not_before = now + retry_after.max(MIN_DEFERRAL);
                debug!(job_id = %entry.job.id, %platform, "probe in flight, deferring");
                shared.emit(CampaignEvent::Deferred {
                    job_id: entry.job.id.clone(),
                    reason: "waiting for circuit probe".into(),
                });
                continue;
            }
            if let Admission::Rejected { retry_after } = admission {
                summary.circuit_rejections += 1;
                summary.platform(platform).circuit_rejections += 1;
                let entry = &mut queue[idx];
                entry.deferrals += 1;
                if entry.deferrals > shared.config.max_deferrals {
                    let entry = queue.swap_remove(idx);
                    info!(job_id = %entry.job.id, %platform, "circuit open, skipping job");
                    let result = JobResult {
                        job_id: entry.job.id.clone(),
                        label: entry.job.label(),
                        platform,
                        outcome: Outcome::Skipped,
                        reason: "circuit open".into(),
                        attempts: entry.attempts_used,
                        confirmation_id: None,
                    };
                    shared.emit(CampaignEvent::Finished(result.clone()));
                    summary.record(result);
                } else {
                    entry.not_before = now + retry_after.max(MIN_DEFERRAL);
                    debug!(job_id = %entry.job.id, %platform, retry_after_ms = retry_after.as_millis() as u64, "circuit open, deferring");
                    shared.emit(CampaignEvent::Deferred {
                        job_id: entry.job.id.clone(),
                        reason: "circuit open".into(),
                    });
                }
                continue;
            }

            if !shared.limiter.try_acquire(platform) {
                if admission == Admission::Probe {
                    shared.breakers.release_probe(platform);
                }
                summary.rate_limited += 1;
                summary.platform(platform).rate_limited += 1;
                let wait = shared.limiter.time_until_available(platform).max(MIN_DEFERRAL);
                queue[idx].not_before = now + wait;
                continue;
            }

            let entry = queue.swap_remove(idx);
            return Pick::Dispatch(entry, admission == Admission::Probe);
        }
    }

    fn handle_done(
        &self,
        done: Result<(tokio::task::Id, JobDone), tokio::task::JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, InFlight>,
        queue: &mut Vec<Queued>,
        summary: &mut CampaignSummary,
    ) {
        let result = match done {
            Ok((id, JobDone::Finished(result))) => {
                in_flight.remove(&id);
                result
            }
            Ok((id, JobDone::Requeue(entry))) => {
                in_flight.remove(&id);
                summary.pool_backpressure += 1;
                self.shared.emit(CampaignEvent::Deferred {
                    job_id: entry.job.id.clone(),
                    reason: "no session available".into(),
                });
                queue.push(entry);
                return;
            }
            Err(e) => {
                let Some(InFlight {
                    job,
                    platform,
                    attempts_used: used,
                    probe,
                }) = in_flight.remove(&e.id())
                else {
                    error!(error = %e, "unknown worker failed");
                    return;
                };
                error!(job_id = %job.id, %platform, probe, error = %e, "worker crashed");
                if e.is_panic() {
                    self.shared.breakers.record_failure(platform, ErrorClass::Structural);
                }
                if probe {
                    self.shared.breakers.release_probe(platform);
                }
                JobResult {
                    job_id: job.id.clone(),
                    label: job.label(),
                    platform,
                    outcome: Outcome::Failed,
                    reason: if e.is_panic() {
                        "worker panicked".into()
                    } else {
                        format!("worker failed: {e}")
                    },
                    attempts: used,
                    confirmation_id: None,
                }
            }
        };
        self.shared.emit(CampaignEvent::Finished(result.clone()));
        summary.record(result);
    }
}

fn result_from(job: &Job, platform: PlatformId, attempt: &Attempt, used: u32) -> JobResult {
    JobResult {
        job_id: job.id.clone(),
        label: job.label(),
        platform,
        outcome: attempt.outcome.unwrap_or(Outcome::Failed),
        reason: attempt.reason.clone(),
        attempts: used,
        confirmation_id: attempt
            .confirmation
            .as_ref()
            .and_then(|c| c.confirmation_id.clone()),
    }
}

async fn run_job(
    shared: Arc<Shared>,
    mut entry: Queued,
    probe: bool,
    profile: Arc<CandidateProfile>,
) -> JobDone {
    let route = shared.router.resolve_strategy(entry.platform);
    let cancel = shared.control.cancel_token().clone();
    let first = entry.attempts_used + 1;

    let outcome = {
        let shared = &shared;
        let job = entry.job.as_ref();
        let route = &route;
        let profile = profile.as_ref();
        let cancel = &cancel;
        run_with_retry(
            &shared.config.retry,
            entry.attempts_used,
            cancel,
            AttemptFailure::disposition,
            |number| async move {
                attempt_once(shared, job, route, profile, cancel, number, number > first).await
            },
        )
        .await
    };

    if probe {
        shared.breakers.release_probe(entry.platform);
    }

    let job = entry.job.clone();
    match outcome {
        RetryOutcome::Completed { value, used } => {
            JobDone::Finished(result_from(&job, entry.platform, &value, used))
        }
        RetryOutcome::Terminal { error, used } | RetryOutcome::Exhausted { error, used } => {
            match error {
                AttemptFailure::Failed(attempt) => {
                    JobDone::Finished(result_from(&job, entry.platform, &attempt, used))
                }
                AttemptFailure::Backpressure(_) => {
                    entry.attempts_used = used;
                    entry.not_before = Instant::now() + shared.config.requeue_delay;
                    JobDone::Requeue(entry)
                }
            }
        }
        RetryOutcome::Backpressure { error, used } => {
            if let AttemptFailure::Backpressure(reason) = &error {
                debug!(job_id = %job.id, %reason, "requeued");
            }
            entry.attempts_used = used;
            entry.not_before = Instant::now() + shared.config.requeue_delay;
            JobDone::Requeue(entry)
        }
        RetryOutcome::Cancelled { used } => JobDone::Finished(JobResult {
            job_id: job.id.clone(),
            label: job.label(),
            platform: entry.platform,
            outcome: Outcome::Aborted,
            reason: "campaign aborted".into(),
            attempts: used,
            confirmation_id: None,
        }),
    }
}

/// One attempt: admission for retries, a session, the executor, then
/// bookkeeping.
async fn attempt_once(
    shared: &Shared,
    job: &Job,
    route: &RouteEntry,
    profile: &CandidateProfile,
    cancel: &CancellationToken,
    number: u32,
    is_retry: bool,
) -> Result<Attempt, AttemptFailure> {
    let platform = route.platform;
    let mut probe = false;
    if is_retry {
        match shared.breakers.try_admit(platform) {
            Admission::Rejected { .. } | Admission::AwaitingProbe { .. } => {
                return Err(AttemptFailure::Backpressure("circuit open".into()));
            }
            Admission::Probe => probe = true,
            Admission::Allowed => {}
        }
        if !shared.limiter.try_acquire(platform) {
            if probe {
                shared.breakers.release_probe(platform);
            }
            return Err(AttemptFailure::Backpressure("rate limited".into()));
        }
    }
    let result = leased_attempt(shared, job, route, profile, cancel, number).await;
    if probe {
        shared.breakers.release_probe(platform);
    }
    result
}

async fn leased_attempt(
    shared: &Shared,
    job: &Job,
    route: &RouteEntry,
    profile: &CandidateProfile,
    cancel: &CancellationToken,
    number: u32,
) -> Result<Attempt, AttemptFailure> {
    let platform = route.platform;

    let lease = tokio::select! {
        _ = cancel.cancelled() => {
            let mut attempt = Attempt::begin(&job.id, platform, number, "");
            let _ = StateMachine::fail(&mut attempt, StepState::Aborted, None, "campaign aborted");
            attempt.finish(Outcome::Aborted, "campaign aborted", None);
            return Ok(attempt);
        }
        lease = shared.pool.acquire(platform) => lease,
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(e) if e.class() == ErrorClass::ResourceExhausted => {
            return Err(AttemptFailure::Backpressure(e.to_string()));
        }
        Err(e) => {
            warn!(job_id = %job.id, %platform, error = %e, "no session for attempt");
            let mut attempt = Attempt::begin(&job.id, platform, number, "");
            let _ = StateMachine::fail(
                &mut attempt,
                StepState::Failed,
                Some(e.class()),
                e.to_string(),
            );
            attempt.finish(Outcome::Failed, e.to_string(), None);
            settle(shared, &attempt).await;
            return Err(AttemptFailure::Failed(attempt));
        }
    };

    let ctx = AttemptContext {
        job,
        profile,
        route,
        number,
        cancel,
        gate: shared.control.gate(),
    };
    let report = shared.executor.execute(ctx, lease.page()).await;
    shared.pool.release(lease, report.session_healthy).await;

    let attempt = report.attempt;
    settle(shared, &attempt).await;
    match attempt.outcome {
        Some(Outcome::Failed) => Err(AttemptFailure::Failed(attempt)),
        _ => Ok(attempt),
    }
}

/// Record the attempt and feed its verdict to the platform's breaker.
async fn settle(shared: &Shared, attempt: &Attempt) {
    if let Err(e) = shared.recorder.record_attempt(attempt).await {
        error!(attempt = %attempt.id, error = %e, "failed to record attempt");
    }
    let platform = attempt.platform;
    match (attempt.outcome, attempt.error) {
        (_, Some(ErrorClass::AntiBot)) => shared.breakers.record_failure(platform, ErrorClass::AntiBot),
        (Some(Outcome::Failed), class) => {
            shared
                .breakers
                .record_failure(platform, class.unwrap_or(ErrorClass::Structural))
        }
        (Some(Outcome::Submitted) | Some(Outcome::PendingReview), _) => {
            shared.breakers.record_success(platform)
        }
        _ => {}
    }
}
