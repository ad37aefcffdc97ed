//! Browser session pool.
//!
//! Sessions are expensive to create, so the pool keeps idle ones around and
//! hands them back out, preferring a session last used on the same platform.
//! Providers are tried in order; a provider that is full, unhealthy or
//! refuses to create a session is skipped in favour of the next one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorClass;
use crate::platform::PlatformId;
use crate::provider::{BrowserPage, SessionOptions, SessionProvider};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool exhausted after waiting {0:?}")]
    Exhausted(Duration),

    #[error("no session provider available: {0}")]
    Unavailable(String),
}

impl PoolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PoolError::Exhausted(_) => ErrorClass::ResourceExhausted,
            PoolError::Unavailable(_) => ErrorClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_age: Duration,
    pub max_uses: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub reap_interval: Duration,
    pub options: SessionOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_uses: 20,
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
            options: SessionOptions {
                headless: true,
                user_agent: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Leased,
    Unhealthy,
}

struct Slot {
    id: u64,
    provider: usize,
    page: Arc<dyn BrowserPage>,
    platform: PlatformId,
    state: SlotState,
    created_at: Instant,
    last_used: Instant,
    uses: u32,
}

impl Slot {
    fn worn_out(&self, config: &PoolConfig, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= config.max_age
            || self.uses >= config.max_uses
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    /// Sessions being created, per provider. Counted against capacity.
    pending: Vec<usize>,
    next_id: u64,
}

impl Inner {
    fn count_for(&self, provider: usize) -> usize {
        self.slots.iter().filter(|s| s.provider == provider).count()
            + self.pending.get(provider).copied().unwrap_or(0)
    }

    fn take(&mut self, id: u64) -> Option<Slot> {
        let idx = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.swap_remove(idx))
    }
}

/// Exclusive use of one browser session. Give it back with
/// [`SessionPool::release`] or [`SessionPool::close`]; a lease dropped
/// without either marks its session unhealthy for the reaper.
pub struct SessionLease {
    slot_id: u64,
    page: Arc<dyn BrowserPage>,
    provider: String,
    platform: PlatformId,
    returned: bool,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl SessionLease {
    pub fn page(&self) -> &dyn BrowserPage {
        self.page.as_ref()
    }

    pub fn session_id(&self) -> &str {
        self.page.id()
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id())
            .field("provider", &self.provider)
            .field("platform", &self.platform)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if let Some(slot) = self.inner.lock().slots.iter_mut().find(|s| s.id == self.slot_id) {
            slot.state = SlotState::Unhealthy;
        }
        warn!(session = %self.page.id(), "session lease dropped without release");
        self.notify.notify_waiters();
    }
}

/// Decrements the provider's pending count however creation ends.
struct Reservation {
    inner: Arc<Mutex<Inner>>,
    provider: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.pending.get_mut(self.provider) {
            *p = p.saturating_sub(1);
        }
    }
}

enum Next {
    Reuse(SessionLease),
    Create(usize),
    Recycle(Slot),
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub unhealthy: usize,
}

pub struct SessionPool {
    providers: Vec<Arc<dyn SessionProvider>>,
    config: PoolConfig,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl SessionPool {
    pub fn new(providers: Vec<Arc<dyn SessionProvider>>, config: PoolConfig) -> Self {
        let inner = Inner {
            pending: vec![0; providers.len()],
            ..Inner::default()
        };
        Self {
            providers,
            config,
            inner: Arc::new(Mutex::new(inner)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.providers.iter().map(|p| p.max_sessions()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats::default();
        for slot in &inner.slots {
            match slot.state {
                SlotState::Idle => stats.idle += 1,
                SlotState::Leased => stats.leased += 1,
                SlotState::Unhealthy => stats.unhealthy += 1,
            }
        }
        stats
    }

    /// Lease a session for `platform`, waiting up to `acquire_timeout` for
    /// one to free up.
    pub async fn acquire(&self, platform: PlatformId) -> Result<SessionLease, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(platform).await? {
                return Ok(lease);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(%platform, "session pool exhausted");
                    return Err(PoolError::Exhausted(self.config.acquire_timeout));
                }
            }
        }
    }

    /// One pass over reuse, creation and recycling. `Ok(None)` means wait.
    async fn try_acquire(&self, platform: PlatformId) -> Result<Option<SessionLease>, PoolError> {
        let mut skipped: Vec<usize> = Vec::new();
        let mut last_error: Option<String> = None;

        loop {
            let (next, worn) = {
                let mut inner = self.inner.lock();
                let now = Instant::now();

                let worn: Vec<Slot> = {
                    let mut out = Vec::new();
                    let mut i = 0;
                    while i < inner.slots.len() {
                        let s = &inner.slots[i];
                        if s.state == SlotState::Idle && s.worn_out(&self.config, now) {
                            out.push(inner.slots.swap_remove(i));
                        } else {
                            i += 1;
                        }
                    }
                    out
                };

                let reusable = inner
                    .slots
                    .iter_mut()
                    .filter(|s| s.state == SlotState::Idle && s.platform == platform)
                    .max_by_key(|s| s.last_used);
                let next = if let Some(slot) = reusable {
                    slot.state = SlotState::Leased;
                    slot.uses += 1;
                    slot.last_used = now;
                    Next::Reuse(self.lease_for(slot))
                } else if let Some(i) = (0..self.providers.len()).find(|&i| {
                    !skipped.contains(&i) && inner.count_for(i) < self.providers[i].max_sessions()
                }) {
                    inner.pending[i] += 1;
                    Next::Create(i)
                } else if let Some(idx) = inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| {
                        s.state == SlotState::Idle
                            && s.platform != platform
                            && !skipped.contains(&s.provider)
                    })
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(i, _)| i)
                {
                    Next::Recycle(inner.slots.swap_remove(idx))
                } else {
                    Next::Wait
                };
                (next, worn)
            };
            self.close_slots(worn).await;

            match next {
                Next::Reuse(lease) => {
                    debug!(%platform, session = %lease.session_id(), "reusing session");
                    return Ok(Some(lease));
                }
                Next::Create(idx) => {
                    let reservation = Reservation {
                        inner: self.inner.clone(),
                        provider: idx,
                    };
                    match self.create_on(idx, platform, reservation).await {
                        Ok(lease) => return Ok(Some(lease)),
                        Err(e) => {
                            warn!(provider = %self.providers[idx].name(), error = %e, "provider skipped");
                            skipped.push(idx);
                            last_error = Some(e);
                        }
                    }
                }
                Next::Recycle(slot) => {
                    debug!(from = %slot.platform, to = %platform, "recycling idle session");
                    self.close_slots(vec![slot]).await;
                }
                Next::Wait => {
                    if skipped.len() == self.providers.len() {
                        return Err(PoolError::Unavailable(
                            last_error.unwrap_or_else(|| "no providers configured".into()),
                        ));
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn create_on(
        &self,
        idx: usize,
        platform: PlatformId,
        reservation: Reservation,
    ) -> Result<SessionLease, String> {
        let provider = &self.providers[idx];
        if !provider.health_check().await {
            return Err(format!("{} failed health check", provider.name()));
        }
        let page = provider
            .create_session(platform, &self.config.options)
            .await
            .map_err(|e| format!("{}: {e}", provider.name()))?;

        let now = Instant::now();
        let lease = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let slot = Slot {
                id: inner.next_id,
                provider: idx,
                page,
                platform,
                state: SlotState::Leased,
                created_at: now,
                last_used: now,
                uses: 1,
            };
            let lease = self.lease_for(&slot);
            inner.slots.push(slot);
            lease
        };
        drop(reservation);
        info!(%platform, provider = %provider.name(), session = %lease.session_id(), "session created");
        Ok(lease)
    }

    fn lease_for(&self, slot: &Slot) -> SessionLease {
        SessionLease {
            slot_id: slot.id,
            page: slot.page.clone(),
            provider: self.providers[slot.provider].name().to_string(),
            platform: slot.platform,
            returned: false,
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Return a lease. Healthy sessions go back to the idle set; unhealthy
    /// ones are closed.
    pub async fn release(&self, lease: SessionLease, healthy: bool) {
        if !healthy {
            return self.close(lease).await;
        }
        let mut lease = lease;
        lease.returned = true;
        if let Some(slot) = self.inner.lock().slots.iter_mut().find(|s| s.id == lease.slot_id) {
            slot.state = SlotState::Idle;
            slot.platform = lease.platform;
            slot.last_used = Instant::now();
        }
        self.notify.notify_waiters();
    }

    /// Return a lease and close its session.
    pub async fn close(&self, lease: SessionLease) {
        let mut lease = lease;
        lease.returned = true;
        let slot = self.inner.lock().take(lease.slot_id);
        if let Some(slot) = slot {
            self.close_slots(vec![slot]).await;
        }
    }

    async fn close_slots(&self, slots: Vec<Slot>) {
        if slots.is_empty() {
            return;
        }
        for slot in slots {
            let provider = &self.providers[slot.provider];
            if let Err(e) = provider.close_session(slot.page.id()).await {
                warn!(session = %slot.page.id(), error = %e, "failed to close session");
            }
        }
        self.notify.notify_waiters();
    }

    /// Close idle sessions past their age, use or idle limits, and any
    /// unhealthy ones. Returns how many were closed.
    pub async fn reap(&self) -> usize {
        let doomed = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let config = &self.config;
            let (doomed, keep): (Vec<Slot>, Vec<Slot>) =
                inner.slots.drain(..).partition(|s| match s.state {
                    SlotState::Unhealthy => true,
                    SlotState::Idle => {
                        s.worn_out(config, now)
                            || now.saturating_duration_since(s.last_used) >= config.idle_timeout
                    }
                    SlotState::Leased => false,
                });
            inner.slots = keep;
            doomed
        };
        let n = doomed.len();
        if n > 0 {
            debug!(closed = n, "reaper closed sessions");
        }
        self.close_slots(doomed).await;
        n
    }

    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reap_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.reap().await;
                    }
                }
            }
        })
    }

    /// Close every session not currently leased.
    pub async fn shutdown(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            let (idle, leased): (Vec<Slot>, Vec<Slot>) = inner
                .slots
                .drain(..)
                .partition(|s| s.state != SlotState::Leased);
            inner.slots = leased;
            idle
        };
        self.close_slots(idle).await;
    }
}
