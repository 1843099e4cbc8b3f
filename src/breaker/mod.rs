//! Circuit breakers for upstream services
//!
//! Each named service gets its own [`CircuitBreaker`], created lazily by the
//! [`BreakerRegistry`] the first time the name is used. The registry is an
//! owned value handed to the gateway; it is not global state.
//!
//! # State machine
//!
//! - **Closed → Open**: on a recorded failure once at least `minimum_calls`
//!   calls were recorded and the window failure rate reaches the threshold
//! - **Open → HalfOpen**: lazily, on the first check after `timeout_ms`
//! - **HalfOpen → Closed**: after `success_threshold` consecutive successes
//! - **HalfOpen → Open**: on any failure

pub mod state;
pub mod window;

pub use state::{BreakerState, BreakerStatus, CircuitBreaker};
pub use window::SlidingWindow;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::config::BreakerConfig;

/// A guarded call failed; the original error is kept as the source
#[derive(Debug, thiserror::Error)]
#[error("call through circuit breaker '{service}' failed (state {state}): {source}")]
pub struct BreakerError<E>
where
    E: std::error::Error + 'static,
{
    /// Service name
    pub service: String,
    /// Breaker mode after the failure was recorded
    pub state: BreakerState,
    /// Error returned by the guarded call
    #[source]
    pub source: E,
}

/// Owned map from service name to breaker
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry; every breaker it creates uses `config`
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `service`, created on first use
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone())))
            .clone()
    }

    /// Run `primary` behind the named breaker, see [`CircuitBreaker::execute`]
    pub async fn execute<T, E, F, Fut, FB>(
        &self,
        service: &str,
        primary: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
        E: std::error::Error + 'static,
    {
        let breaker = self.get(service);
        breaker.execute(primary, fallback).await
    }

    /// Current mode of a known breaker
    pub fn state(&self, service: &str) -> Option<BreakerState> {
        self.lock().get(service).map(|b| b.state())
    }

    /// Status of a known breaker
    pub fn status(&self, service: &str) -> Option<BreakerStatus> {
        self.lock().get(service).map(|b| b.status())
    }

    /// Status of every breaker, sorted by name
    pub fn all_statuses(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut statuses: Vec<BreakerStatus> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Force the named breaker open, creating it if needed
    pub fn force_open(&self, service: &str, reason: &str) {
        info!(service = service, reason = reason, "Forcing circuit breaker open");
        self.get(service).force_open(reason);
    }

    /// Force the named breaker closed, creating it if needed
    pub fn force_close(&self, service: &str) {
        info!(service = service, "Forcing circuit breaker closed");
        self.get(service).force_close();
    }

    /// Reset counters of the named breaker; returns false if it does not exist
    pub fn reset_metrics(&self, service: &str) -> bool {
        match self.lock().get(service) {
            Some(breaker) => {
                breaker.reset_metrics();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
