//! Per-platform token buckets.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::platform::PlatformId;

/// Refill rate and capacity of one platform's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn per_minute(requests: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: requests as f64 / 60.0,
            burst,
        }
    }

    /// Conservative defaults per platform.
    pub fn default_for(platform: PlatformId) -> Self {
        match platform {
            PlatformId::Greenhouse => Self::per_minute(30, 5),
            PlatformId::Lever => Self::per_minute(20, 3),
            PlatformId::Ashby => Self::per_minute(25, 4),
            PlatformId::LinkedIn => Self::per_minute(15, 3),
            PlatformId::Indeed => Self::per_minute(20, 4),
            PlatformId::Workday => Self::per_minute(10, 2),
            PlatformId::Taleo | PlatformId::Unknown => Self::per_minute(15, 3),
        }
    }
}

/// Continuous-refill token bucket. Tokens stay within `[0, capacity]`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        let capacity = limit.burst.max(1) as f64;
        Self {
            capacity,
            rate: limit.rate_per_sec.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // A clock that appears to go backwards never adds tokens.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Time until one whole token is available. `Duration::MAX` when the
    /// bucket never refills.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).unwrap_or(Duration::MAX)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<PlatformId, TokenBucket>,
    stats: HashMap<PlatformId, LimiterStats>,
}

/// One bucket per platform, created lazily from the configured limits.
pub struct RateLimiterRegistry {
    limits: HashMap<PlatformId, RateLimit>,
    inner: Mutex<Inner>,
}

impl RateLimiterRegistry {
    pub fn new(overrides: HashMap<PlatformId, RateLimit>) -> Self {
        let limits = PlatformId::ALL
            .into_iter()
            .map(|p| (p, overrides.get(&p).copied().unwrap_or_else(|| RateLimit::default_for(p))))
            .collect();
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn limit_for(&self, platform: PlatformId) -> RateLimit {
        self.limits
            .get(&platform)
            .copied()
            .unwrap_or_else(|| RateLimit::default_for(platform))
    }

    fn with_bucket<T>(
        &self,
        platform: PlatformId,
        now: Instant,
        f: impl FnOnce(&mut TokenBucket, &mut LimiterStats) -> T,
    ) -> T {
        let limit = self.limit_for(platform);
        let mut inner = self.inner.lock();
        let Inner { buckets, stats } = &mut *inner;
        let bucket = buckets
            .entry(platform)
            .or_insert_with(|| TokenBucket::new(limit, now));
        let stats = stats.entry(platform).or_default();
        f(bucket, stats)
    }

    /// Take one token if available. Never waits.
    pub fn try_acquire(&self, platform: PlatformId) -> bool {
        self.try_acquire_at(platform, Instant::now())
    }

    pub fn try_acquire_at(&self, platform: PlatformId, now: Instant) -> bool {
        self.with_bucket(platform, now, |bucket, stats| {
            let ok = bucket.try_take(now);
            if ok {
                stats.allowed += 1;
            } else {
                stats.denied += 1;
                debug!(%platform, "rate limited");
            }
            ok
        })
    }

    pub fn time_until_available(&self, platform: PlatformId) -> Duration {
        let now = Instant::now();
        self.with_bucket(platform, now, |bucket, _| bucket.time_until_available(now))
    }

    pub fn tokens(&self, platform: PlatformId) -> f64 {
        let now = Instant::now();
        self.with_bucket(platform, now, |bucket, _| bucket.available(now))
    }

    pub fn stats(&self) -> HashMap<PlatformId, LimiterStats> {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry(rate: f64, burst: u32) -> RateLimiterRegistry {
        let mut overrides = HashMap::new();
        overrides.insert(PlatformId::Lever, RateLimit { rate_per_sec: rate, burst });
        RateLimiterRegistry::new(overrides)
    }

    #[test]
    fn defaults_match_platform_table() {
        let r = RateLimiterRegistry::new(HashMap::new());
        assert_eq!(r.limit_for(PlatformId::Greenhouse).burst, 5);
        assert_eq!(r.limit_for(PlatformId::Workday).burst, 2);
        assert!((r.limit_for(PlatformId::Greenhouse).rate_per_sec - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let r = registry(1.0, 2);
        assert!(r.try_acquire(PlatformId::Lever));
        assert!(r.try_acquire(PlatformId::Lever));
        assert!(!r.try_acquire(PlatformId::Lever));
        let wait = r.time_until_available(PlatformId::Lever);
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(r.try_acquire(PlatformId::Lever));
        assert!(!r.try_acquire(PlatformId::Lever));

        let stats = r.stats()[&PlatformId::Lever];
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.denied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let r = registry(100.0, 3);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(r.tokens(PlatformId::Lever) <= 3.0);
        assert_eq!(r.time_until_available(PlatformId::Lever), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn platforms_are_independent() {
        let r = registry(0.0, 1);
        assert!(r.try_acquire(PlatformId::Lever));
        assert!(!r.try_acquire(PlatformId::Lever));
        assert_eq!(r.time_until_available(PlatformId::Lever), Duration::MAX);
        assert!(r.try_acquire(PlatformId::Greenhouse));
    }

    #[test]
    fn backwards_clock_adds_nothing() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(RateLimit { rate_per_sec: 10.0, burst: 1 }, start + Duration::from_secs(5));
        assert!(bucket.try_take(start + Duration::from_secs(5)));
        assert!(!bucket.try_take(start));
        assert!(bucket.available(start) >= 0.0);
    }

    #[test]
    fn concurrent_acquirers_never_overdraw() {
        let r = Arc::new(registry(0.0, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || (0..10).filter(|_| r.try_acquire(PlatformId::Lever)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
        assert!(r.tokens(PlatformId::Lever) >= 0.0);
    }
}
