//! Single-service circuit breaker state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::window::SlidingWindow;
use super::BreakerError;
use crate::config::BreakerConfig;
use crate::metrics;

/// Breaker mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls pass through and outcomes are recorded
    Closed,
    /// Calls are refused until the timeout elapses
    Open,
    /// Trial calls pass through; one failure reopens
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding for the state gauge
    pub fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a breaker for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    /// Service name
    pub service: String,
    /// Current mode
    pub state: BreakerState,
    /// Calls recorded since creation or the last metrics reset
    pub total_calls: u64,
    /// Successful calls
    pub success_calls: u64,
    /// Failed calls
    pub failure_calls: u64,
    /// Lifetime success percentage (100 when no calls)
    pub success_rate: f64,
    /// Consecutive successes while half-open
    pub consecutive_successes: u32,
    /// Wall-clock time of the last state change
    pub last_transition: DateTime<Utc>,
    /// Failure percentage over the sliding window
    pub window_failure_rate: f64,
    /// Outcomes currently held by the window
    pub window_filled: usize,
    /// Reason attached to the most recent failure or forced open
    pub last_failure_reason: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_successes: u32,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    window: SlidingWindow,
    total_calls: u64,
    success_calls: u64,
    failure_calls: u64,
    last_failure_reason: Option<String>,
}

/// Circuit breaker guarding one named upstream service
///
/// Every counter and the sliding window live behind a single mutex so a
/// recorded outcome is applied as one unit. The lock is never held while the
/// guarded call is running.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        debug!(
            service = %name,
            failure_threshold = config.failure_threshold,
            window = config.sliding_window_size,
            "Creating circuit breaker"
        );
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_successes: 0,
                last_transition: Instant::now(),
                last_transition_at: Utc::now(),
                window: SlidingWindow::new(config.sliding_window_size),
                total_calls: 0,
                success_calls: 0,
                failure_calls: 0,
                last_failure_reason: None,
            }),
            name,
            config,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current mode, without evaluating the open timeout
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may proceed now
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// Whether a call may proceed at `now`
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here and
    /// lets the call through.
    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = now.saturating_duration_since(inner.last_transition);
                if elapsed >= self.config.timeout() {
                    self.transition(&mut inner, BreakerState::HalfOpen, now, "timeout elapsed");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.success_calls += 1;
        inner.window.record(true);

        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                self.transition(
                    &mut inner,
                    BreakerState::Closed,
                    Instant::now(),
                    "success threshold reached",
                );
                inner.consecutive_successes = 0;
                inner.window.reset();
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.failure_calls += 1;
        inner.window.record(false);
        inner.consecutive_successes = 0;
        inner.last_failure_reason = Some(reason.to_string());

        match inner.state {
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open, Instant::now(), "failure while half-open");
            }
            BreakerState::Closed if self.should_open(&inner) => {
                self.transition(
                    &mut inner,
                    BreakerState::Open,
                    Instant::now(),
                    "failure threshold reached",
                );
            }
            _ => {}
        }
    }

    /// Open the breaker regardless of recorded outcomes
    pub fn force_open(&self, reason: &str) {
        let mut inner = self.lock();
        self.transition(&mut inner, BreakerState::Open, Instant::now(), "forced open");
        inner.consecutive_successes = 0;
        inner.last_failure_reason = Some(reason.to_string());
    }

    /// Close the breaker and clear the sliding window
    pub fn force_close(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, BreakerState::Closed, Instant::now(), "forced closed");
        inner.consecutive_successes = 0;
        inner.window.reset();
    }

    /// Clear counters and the sliding window without changing mode
    pub fn reset_metrics(&self) {
        let mut inner = self.lock();
        inner.total_calls = 0;
        inner.success_calls = 0;
        inner.failure_calls = 0;
        inner.consecutive_successes = 0;
        inner.window.reset();
        inner.last_failure_reason = None;
        info!(service = %self.name, "Circuit breaker metrics reset");
    }

    /// Snapshot for status reporting
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        let success_rate = if inner.total_calls > 0 {
            inner.success_calls as f64 / inner.total_calls as f64 * 100.0
        } else {
            100.0
        };
        BreakerStatus {
            service: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            success_calls: inner.success_calls,
            failure_calls: inner.failure_calls,
            success_rate,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.last_transition_at,
            window_failure_rate: inner.window.failure_rate(),
            window_filled: inner.window.filled(),
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    /// Run `primary` behind the breaker, or `fallback` when calls are refused
    ///
    /// A refused call never touches `primary` or the counters. A failed call is
    /// recorded and wrapped in [`BreakerError`] carrying the service name and the
    /// mode after recording.
    pub async fn execute<T, E, F, Fut, FB>(&self, primary: F, fallback: FB) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
        E: std::error::Error + 'static,
    {
        if !self.can_execute() {
            debug!(service = %self.name, "Circuit breaker refused call, using fallback");
            metrics::record_breaker_rejection(&self.name);
            return Ok(fallback());
        }

        match primary().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(source) => {
                self.record_failure(&source.to_string());
                Err(BreakerError {
                    service: self.name.clone(),
                    state: self.state(),
                    source,
                })
            }
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        if inner.total_calls < u64::from(self.config.minimum_calls) {
            return false;
        }
        inner.window.failure_rate() >= self.config.threshold_percent()
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: Instant, cause: &str) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;
        inner.last_transition_at = Utc::now();

        if to == BreakerState::Open {
            warn!(
                service = %self.name,
                from = %from,
                to = %to,
                cause = cause,
                window_failure_rate = inner.window.failure_rate(),
                "Circuit breaker opened"
            );
        } else {
            info!(service = %self.name, from = %from, to = %to, cause = cause, "Circuit breaker transition");
        }
        metrics::record_breaker_transition(&self.name, from, to);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
