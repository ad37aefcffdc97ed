//! Generic retry coordinator, parameterised by a failure classifier.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }
}

/// What a failure means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
    /// Not the job's fault; hand it back to the scheduler without using up an attempt.
    Backpressure,
}

impl From<ErrorClass> for Disposition {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Transient => Disposition::Retryable,
            ErrorClass::ResourceExhausted => Disposition::Backpressure,
            ErrorClass::Structural | ErrorClass::Policy | ErrorClass::AntiBot => {
                Disposition::Terminal
            }
        }
    }
}

/// Result of `run_with_retry`. `used` counts attempts that consumed a retry,
/// including any already used before this call.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Completed { value: T, used: u32 },
    Exhausted { error: E, used: u32 },
    Terminal { error: E, used: u32 },
    Backpressure { error: E, used: u32 },
    Cancelled { used: u32 },
}

/// Run `op` until it succeeds, fails terminally, runs out of attempts,
/// hits backpressure or `cancel` fires.
///
/// `op` receives the 1-based attempt number. `already_used` lets a requeued
/// job resume its attempt count; it is clamped so at least one attempt runs.
pub async fn run_with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    already_used: u32,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Disposition,
{
    let max = policy.max_attempts.max(1);
    let mut used = already_used.min(max - 1);

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled { used };
        }

        let attempt = used + 1;
        let error = match op(attempt).await {
            Ok(value) => return RetryOutcome::Completed { value, used: attempt },
            Err(e) => e,
        };

        match classify(&error) {
            Disposition::Backpressure => return RetryOutcome::Backpressure { error, used },
            Disposition::Terminal => return RetryOutcome::Terminal { error, used: attempt },
            Disposition::Retryable => {
                used = attempt;
                if used >= max {
                    return RetryOutcome::Exhausted { error, used };
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled { used },
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
