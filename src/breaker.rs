//! Per-platform circuit breakers.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ErrorClass;
use crate::platform::PlatformId;
use crate::state_machine::{Attempt, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Failures older than this no longer count towards the threshold.
    pub window: Duration,
    /// Weight of an anti-bot challenge relative to an ordinary failure.
    pub captcha_weight: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
            max_cooldown: Duration::from_secs(3600),
            window: Duration::from_secs(600),
            captcha_weight: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial. Its result decides the breaker's fate.
    Probe,
    Rejected { retry_after: Duration },
    /// Half-open with the probe still running. Ask again after `retry_after`.
    AwaitingProbe { retry_after: Duration },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    failures: VecDeque<(Instant, u32)>,
    opened_at: Instant,
    cooldown: Duration,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: now,
            cooldown: config.cooldown,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = now;
        self.probe_in_flight = false;
        self.failures.clear();
    }

    fn weight(&mut self, config: &BreakerConfig, now: Instant) -> u32 {
        while let Some(&(at, _)) = self.failures.front() {
            if now.saturating_duration_since(at) > config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.iter().map(|(_, w)| *w).sum()
    }
}

/// One breaker per platform, all behind a single lock.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<PlatformId, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn with<T>(&self, platform: PlatformId, now: Instant, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut map = self.breakers.lock();
        let breaker = map
            .entry(platform)
            .or_insert_with(|| CircuitBreaker::new(&self.config, now));
        f(breaker)
    }

    pub fn try_admit(&self, platform: PlatformId) -> Admission {
        self.try_admit_at(platform, Instant::now())
    }

    pub fn try_admit_at(&self, platform: PlatformId, now: Instant) -> Admission {
        let probe_wait = self.config.cooldown.min(Duration::from_secs(30));
        self.with(platform, now, |b| match b.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let reopen = b.opened_at + b.cooldown;
                if now >= reopen {
                    b.state = BreakerState::HalfOpen;
                    b.probe_in_flight = true;
                    info!(%platform, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: reopen - now,
                    }
                }
            }
            BreakerState::HalfOpen if b.probe_in_flight => Admission::AwaitingProbe {
                retry_after: probe_wait,
            },
            BreakerState::HalfOpen => {
                b.probe_in_flight = true;
                Admission::Probe
            }
        })
    }

    pub fn record_success(&self, platform: PlatformId) {
        self.record_success_at(platform, Instant::now())
    }

    pub fn record_success_at(&self, platform: PlatformId, now: Instant) {
        let base = self.config.cooldown;
        self.with(platform, now, |b| match b.state {
            BreakerState::HalfOpen => {
                b.state = BreakerState::Closed;
                b.cooldown = base;
                b.probe_in_flight = false;
                b.failures.clear();
                info!(%platform, "circuit closed after successful probe");
            }
            BreakerState::Closed => b.failures.clear(),
            // Late result from an attempt admitted before the circuit opened.
            BreakerState::Open => {}
        })
    }

    pub fn record_failure(&self, platform: PlatformId, class: ErrorClass) {
        self.record_failure_at(platform, class, Instant::now())
    }

    pub fn record_failure_at(&self, platform: PlatformId, class: ErrorClass, now: Instant) {
        let config = self.config;
        let weight = if class == ErrorClass::AntiBot {
            config.captcha_weight.max(1)
        } else {
            1
        };
        self.with(platform, now, |b| match b.state {
            BreakerState::HalfOpen => {
                b.cooldown = (b.cooldown * 2).min(config.max_cooldown);
                b.open(now);
                warn!(%platform, cooldown_secs = b.cooldown.as_secs(), "probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                b.failures.push_back((now, weight));
                let total = b.weight(&config, now);
                if total >= config.failure_threshold {
                    b.open(now);
                    warn!(%platform, failures = total, "circuit opened");
                }
            }
            BreakerState::Open => {}
        })
    }

    /// A probe ended without a verdict (policy outcome, backpressure, abort).
    pub fn release_probe(&self, platform: PlatformId) {
        self.with(platform, Instant::now(), |b| {
            if b.state == BreakerState::HalfOpen {
                b.probe_in_flight = false;
            }
        })
    }

    pub fn state(&self, platform: PlatformId) -> BreakerState {
        self.breakers
            .lock()
            .get(&platform)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self) -> HashMap<PlatformId, BreakerState> {
        self.breakers
            .lock()
            .iter()
            .map(|(p, b)| (*p, b.state))
            .collect()
    }

    /// Rebuild one platform's breaker from recorded attempts. Only the
    /// trailing run of failures (anti-bot skips included) counts; if it
    /// reaches the threshold the circuit opens for whatever is left of the
    /// cooldown.
    pub fn seed_from_history(&self, platform: PlatformId, history: &[Attempt]) {
        let mut finished: Vec<&Attempt> = history
            .iter()
            .filter(|a| a.platform == platform && a.finished_at.is_some())
            .collect();
        finished.sort_by_key(|a| a.finished_at);

        let mut streak = 0u32;
        let mut last_failure = None;
        for attempt in finished.iter().rev() {
            let weight = match (attempt.outcome, attempt.error) {
                (_, Some(ErrorClass::AntiBot)) => self.config.captcha_weight.max(1),
                (Some(Outcome::Failed), _) => 1,
                (Some(Outcome::Submitted) | Some(Outcome::PendingReview), _) => break,
                _ => continue,
            };
            streak += weight;
            if last_failure.is_none() {
                last_failure = attempt.finished_at;
            }
        }
        let Some(last) = last_failure else {
            return;
        };
        if streak < self.config.failure_threshold {
            return;
        }
        let since = (chrono::Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        if since >= self.config.cooldown {
            return;
        }
        let now = Instant::now();
        let opened_at = now.checked_sub(since).unwrap_or(now);
        self.with(platform, now, |b| b.open(opened_at));
        warn!(%platform, streak, "circuit seeded open from history");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Attempt;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(200),
            window: Duration::from_secs(120),
            captcha_weight: 3,
        }
    }

    fn trip(r: &CircuitBreakerRegistry, p: PlatformId, now: Instant) {
        for _ in 0..5 {
            r.record_failure_at(p, ErrorClass::Transient, now);
        }
    }

    #[test]
    fn opens_after_threshold_and_rejects() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        for _ in 0..4 {
            r.record_failure_at(PlatformId::Lever, ErrorClass::Transient, t0);
        }
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Closed);
        r.record_failure_at(PlatformId::Lever, ErrorClass::Structural, t0);
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Open);

        match r.try_admit_at(PlatformId::Lever, t0 + Duration::from_secs(10)) {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(50)),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(r.try_admit_at(PlatformId::Greenhouse, t0), Admission::Allowed);
    }

    #[test]
    fn success_resets_the_streak() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        for _ in 0..4 {
            r.record_failure_at(PlatformId::Lever, ErrorClass::Transient, t0);
        }
        r.record_success_at(PlatformId::Lever, t0);
        for _ in 0..4 {
            r.record_failure_at(PlatformId::Lever, ErrorClass::Transient, t0);
        }
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Closed);
    }

    #[test]
    fn exactly_one_probe_then_close() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        trip(&r, PlatformId::Lever, t0);
        let later = t0 + Duration::from_secs(61);
        assert_eq!(r.try_admit_at(PlatformId::Lever, later), Admission::Probe);
        assert!(matches!(
            r.try_admit_at(PlatformId::Lever, later),
            Admission::AwaitingProbe { .. }
        ));
        r.record_success_at(PlatformId::Lever, later);
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Closed);
        assert_eq!(r.try_admit_at(PlatformId::Lever, later), Admission::Allowed);
    }

    #[test]
    fn failed_probe_doubles_cooldown_up_to_cap() {
        let r = CircuitBreakerRegistry::new(config());
        let mut now = Instant::now();
        trip(&r, PlatformId::Workday, now);

        let mut expected = Duration::from_secs(60);
        for _ in 0..4 {
            now += expected;
            assert_eq!(r.try_admit_at(PlatformId::Workday, now), Admission::Probe);
            r.record_failure_at(PlatformId::Workday, ErrorClass::Transient, now);
            expected = (expected * 2).min(Duration::from_secs(200));
            match r.try_admit_at(PlatformId::Workday, now) {
                Admission::Rejected { retry_after } => assert_eq!(retry_after, expected),
                other => panic!("expected rejection, got {other:?}"),
            }
        }
        assert_eq!(expected, Duration::from_secs(200));

        // Recovery resets the cooldown to base.
        now += expected;
        assert_eq!(r.try_admit_at(PlatformId::Workday, now), Admission::Probe);
        r.record_success_at(PlatformId::Workday, now);
        trip(&r, PlatformId::Workday, now);
        match r.try_admit_at(PlatformId::Workday, now) {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn released_probe_can_be_retaken() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        trip(&r, PlatformId::Lever, t0);
        let later = t0 + Duration::from_secs(61);
        assert_eq!(r.try_admit_at(PlatformId::Lever, later), Admission::Probe);
        r.release_probe(PlatformId::Lever);
        assert_eq!(r.try_admit_at(PlatformId::Lever, later), Admission::Probe);
    }

    #[test]
    fn captcha_weighs_more() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        r.record_failure_at(PlatformId::LinkedIn, ErrorClass::AntiBot, t0);
        assert_eq!(r.state(PlatformId::LinkedIn), BreakerState::Closed);
        r.record_failure_at(PlatformId::LinkedIn, ErrorClass::AntiBot, t0);
        assert_eq!(r.state(PlatformId::LinkedIn), BreakerState::Open);
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let r = CircuitBreakerRegistry::new(config());
        let t0 = Instant::now();
        for _ in 0..4 {
            r.record_failure_at(PlatformId::Lever, ErrorClass::Transient, t0);
        }
        r.record_failure_at(PlatformId::Lever, ErrorClass::Transient, t0 + Duration::from_secs(121));
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Closed);
    }

    fn finished(platform: PlatformId, outcome: Outcome, error: Option<ErrorClass>) -> Attempt {
        let mut a = Attempt::begin("j", platform, 1, "s");
        a.error = error;
        a.finish(outcome, "x", None);
        a
    }

    #[test]
    fn seeding_opens_on_recent_failure_streak() {
        let r = CircuitBreakerRegistry::new(config());
        let mut history = vec![finished(PlatformId::Lever, Outcome::PendingReview, None)];
        for _ in 0..5 {
            history.push(finished(PlatformId::Lever, Outcome::Failed, Some(ErrorClass::Transient)));
        }
        history.push(finished(PlatformId::Greenhouse, Outcome::Failed, Some(ErrorClass::Transient)));
        r.seed_from_history(PlatformId::Lever, &history);
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Open);

        r.seed_from_history(PlatformId::Greenhouse, &history);
        assert_eq!(r.state(PlatformId::Greenhouse), BreakerState::Closed);
    }

    #[test]
    fn seeding_ignores_streaks_broken_by_success() {
        let r = CircuitBreakerRegistry::new(config());
        let mut history = Vec::new();
        for _ in 0..5 {
            history.push(finished(PlatformId::Lever, Outcome::Failed, Some(ErrorClass::Transient)));
        }
        std::thread::sleep(Duration::from_millis(5));
        history.push(finished(PlatformId::Lever, Outcome::PendingReview, None));
        r.seed_from_history(PlatformId::Lever, &history);
        assert_eq!(r.state(PlatformId::Lever), BreakerState::Closed);
    }

    #[test]
    fn seeding_counts_anti_bot_skips_with_weight() {
        let r = CircuitBreakerRegistry::new(config());
        let history = vec![
            finished(PlatformId::LinkedIn, Outcome::Skipped, Some(ErrorClass::AntiBot)),
            finished(PlatformId::LinkedIn, Outcome::Skipped, Some(ErrorClass::Policy)),
            finished(PlatformId::LinkedIn, Outcome::Skipped, Some(ErrorClass::AntiBot)),
        ];
        r.seed_from_history(PlatformId::LinkedIn, &history);
        assert_eq!(r.state(PlatformId::LinkedIn), BreakerState::Open);
    }
}
