//! Dual-window rate limiter shared by every outbound request
//!
//! A per-minute token bucket bounds bursts and a per-day counter bounds the
//! daily quota. Both live in one record that is persisted after every
//! granted request, so a restart resumes the same budget.
//!
//! The limiter fails open: if the persisted record cannot be read or
//! written, the request is allowed and the failure is logged.

pub mod state;

pub use state::{until_next_utc_day, RateLimitState};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::RateLimitConfig;
use crate::metrics;
use crate::storage::StateStore;

/// Which window denied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The daily quota is used up until the next UTC day
    DailyCap,
    /// The per-minute bucket is empty
    Bucket,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::DailyCap => write!(f, "daily_cap"),
            DenialReason::Bucket => write!(f, "bucket"),
        }
    }
}

/// Outcome of [`RateLimiter::try_acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request may proceed
    pub allowed: bool,
    /// When a denied request could next succeed; zero when allowed
    pub retry_after: Duration,
    /// Window that denied the request
    pub reason: Option<DenialReason>,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            reason: None,
        }
    }

    fn deny(reason: DenialReason, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            reason: Some(reason),
        }
    }
}

/// Snapshot for status output
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Whole tokens left in the bucket
    pub tokens_available: u32,
    /// Bucket capacity
    pub requests_per_minute: u32,
    /// Requests granted in the current per-minute window
    pub requests_in_window: u32,
    /// Requests granted today
    pub daily_requests: u32,
    /// Daily quota
    pub requests_per_day: u32,
    /// Requests left today
    pub daily_remaining: u32,
    /// Time until the daily counter resets
    pub until_daily_reset: Duration,
    /// Acquisitions attempted by this process
    pub total_requests: u64,
    /// Acquisitions denied by this process
    pub rejected_requests: u64,
    /// Share of attempts that were admitted, in percent (100 when idle)
    pub success_rate: f64,
    /// Whether the in-memory state came from the store
    pub loaded: bool,
}

/// Process-wide limiter; share it behind an `Arc`
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn StateStore>,
    state: Mutex<Option<RateLimitState>>,
    total: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter backed by `store`
    ///
    /// Nothing is read until the first acquire.
    pub fn new(config: RateLimitConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(None),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Limits in effect
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to take one request slot for `endpoint`
    pub fn try_acquire(&self, endpoint: &str) -> Admission {
        self.try_acquire_at(endpoint, Utc::now())
    }

    /// [`try_acquire`](Self::try_acquire) against an explicit clock
    pub fn try_acquire_at(&self, endpoint: &str, now: DateTime<Utc>) -> Admission {
        let capacity = self.config.requests_per_minute;
        let interval = self.refill_interval();
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();

        let Some(state) = self.ensure_loaded(&mut guard, now) else {
            metrics::record_rate_limit_allowed(endpoint);
            return Admission::allow();
        };

        state.roll_daily(now);
        if state.daily_requests >= self.config.requests_per_day {
            let retry_after = until_next_utc_day(now);
            debug!(
                endpoint = endpoint,
                daily_requests = state.daily_requests,
                retry_after_ms = retry_after.as_millis() as u64,
                "Daily request cap reached"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_rate_limit_denied(endpoint, DenialReason::DailyCap);
            return Admission::deny(DenialReason::DailyCap, retry_after);
        }

        state.refill(now, capacity, interval);
        if state.tokens < 1.0 {
            let retry_after = state.time_until_next_token(capacity, interval);
            debug!(
                endpoint = endpoint,
                retry_after_ms = retry_after.as_millis() as u64,
                "Per-minute bucket empty"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_rate_limit_denied(endpoint, DenialReason::Bucket);
            return Admission::deny(DenialReason::Bucket, retry_after);
        }

        state.tokens -= 1.0;
        state.roll_window(now, interval);
        state.requests_in_window += 1;
        state.daily_requests += 1;

        if let Err(e) = self.store.persist_rate_limit_state(state) {
            warn!(endpoint = endpoint, error = %e, "Failed to persist rate limit state, allowing request");
            metrics::record_rate_limit_persistence_error("persist");
        }

        trace!(
            endpoint = endpoint,
            tokens = state.tokens,
            daily_requests = state.daily_requests,
            "Rate limit token acquired"
        );
        metrics::record_rate_limit_allowed(endpoint);
        Admission::allow()
    }

    /// Empty the bucket after the upstream signalled throttling
    pub fn drain(&self) {
        self.drain_at(Utc::now());
    }

    /// [`drain`](Self::drain) against an explicit clock
    pub fn drain_at(&self, now: DateTime<Utc>) {
        let mut guard = self.lock();
        let Some(state) = self.ensure_loaded(&mut guard, now) else {
            return;
        };

        state.tokens = 0.0;
        state.last_refill = now;
        warn!(tokens = 0, "Upstream throttled, draining rate limit bucket");

        if let Err(e) = self.store.persist_rate_limit_state(state) {
            warn!(error = %e, "Failed to persist drained rate limit state");
            metrics::record_rate_limit_persistence_error("persist");
        }
    }

    /// Current counters
    pub fn status(&self) -> RateLimitStatus {
        self.status_at(Utc::now())
    }

    /// [`status`](Self::status) against an explicit clock
    pub fn status_at(&self, now: DateTime<Utc>) -> RateLimitStatus {
        let capacity = self.config.requests_per_minute;
        let interval = self.refill_interval();
        let mut guard = self.lock();
        let loaded = self.ensure_loaded(&mut guard, now).is_some();

        // Project forward without mutating the held state
        let mut view = guard
            .clone()
            .unwrap_or_else(|| RateLimitState::fresh(now, capacity));
        view.roll_daily(now);
        view.refill(now, capacity, interval);

        let total = self.total.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let success_rate = if total == 0 {
            100.0
        } else {
            (total - rejected.min(total)) as f64 / total as f64 * 100.0
        };

        RateLimitStatus {
            tokens_available: view.tokens.floor().max(0.0) as u32,
            requests_per_minute: capacity,
            requests_in_window: view.requests_in_window,
            daily_requests: view.daily_requests,
            requests_per_day: self.config.requests_per_day,
            daily_remaining: self.config.requests_per_day.saturating_sub(view.daily_requests),
            until_daily_reset: until_next_utc_day(now),
            total_requests: total,
            rejected_requests: rejected,
            success_rate,
            loaded,
        }
    }

    fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.config.refill_interval_ms.max(1))
    }

    /// Load state from the store once; `None` means the store is unavailable
    fn ensure_loaded<'a>(
        &self,
        slot: &'a mut Option<RateLimitState>,
        now: DateTime<Utc>,
    ) -> Option<&'a mut RateLimitState> {
        if slot.is_none() {
            match self.store.load_rate_limit_state() {
                Ok(Some(persisted)) => {
                    debug!(
                        daily_requests = persisted.daily_requests,
                        tokens = persisted.tokens,
                        "Loaded persisted rate limit state"
                    );
                    *slot = Some(persisted);
                }
                Ok(None) => {
                    *slot = Some(RateLimitState::fresh(now, self.config.requests_per_minute));
                }
                Err(e) => {
                    warn!(error = %e, "Rate limit state unavailable, failing open");
                    metrics::record_rate_limit_persistence_error("load");
                    return None;
                }
            }
        }
        slot.as_mut()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RateLimitState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
