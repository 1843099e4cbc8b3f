//! HTTP gateway to the upstream stats API
//!
//! Order of checks for every call:
//! 1. the service breaker (open means a [`Denial::CircuitOpen`] fallback)
//! 2. the rate limiter (no budget means a [`Denial::RateLimited`] fallback)
//! 3. the request itself, inside the breaker, with capped exponential
//!    backoff on network errors and 5xx responses
//!
//! A 429 drains the limiter bucket and surfaces as [`Denial::Throttled`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{collection_endpoint, entity_endpoint, Denial, Fetch, GatewayError, PageRequest, Result, Upstream};
use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::config::{ApiConfig, IngestConfig};
use crate::limiter::RateLimiter;
use crate::metrics::{self, RequestOutcome, RequestTimer};
use crate::storage::StateStore;
use crate::Collection;

/// Breaker name for the upstream API
pub const SERVICE_NAME: &str = "opendota";

/// Upper bound for a single retry backoff, in milliseconds
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Longest error body kept in [`GatewayError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// Backoff before retry number `retry_count` (0-based): `base * 2^n`, capped
pub fn calculate_backoff(base_ms: u64, retry_count: u32) -> Duration {
    let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS);
    Duration::from_millis(delay_ms)
}

/// Production [`Upstream`] backed by reqwest
pub struct ApiGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_backoff_ms: u64,
    breakers: BreakerRegistry,
    limiter: Arc<RateLimiter>,
}

impl ApiGateway {
    /// Create a gateway from explicit parts
    ///
    /// # Errors
    /// Returns [`GatewayError::Client`] if the HTTP client cannot be built
    pub fn new(api: &ApiConfig, breakers: BreakerRegistry, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(api.connect_timeout_ms))
            .timeout(Duration::from_millis(api.request_timeout_ms))
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone().filter(|k| !k.trim().is_empty()),
            max_retries: api.max_retries,
            retry_backoff_ms: api.retry_backoff_ms,
            breakers,
            limiter,
        })
    }

    /// Wire a gateway with a fresh breaker registry and a limiter persisted in `store`
    pub fn from_config(config: &IngestConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), store));
        Self::new(&config.api, breakers, limiter)
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Breakers owned by this gateway
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Shared rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn get(&self, path: String, query: Vec<(&'static str, String)>) -> Result<Fetch> {
        let breaker = self.breakers.get(SERVICE_NAME);
        let circuit_open = || {
            Fetch::Denied(Denial::CircuitOpen {
                service: SERVICE_NAME.to_string(),
            })
        };

        if !breaker.can_execute() {
            debug!(endpoint = %path, "Circuit open, skipping request");
            metrics::record_breaker_rejection(SERVICE_NAME);
            return Ok(circuit_open());
        }

        let admission = self.limiter.try_acquire(&path);
        if !admission.allowed {
            let reason = admission.reason.unwrap_or(crate::limiter::DenialReason::Bucket);
            debug!(
                endpoint = %path,
                reason = %reason,
                retry_after_ms = admission.retry_after.as_millis() as u64,
                "Rate limiter denied request"
            );
            return Ok(Fetch::Denied(Denial::RateLimited {
                retry_after: admission.retry_after,
                reason,
            }));
        }

        breaker
            .execute(|| self.request_with_retry(&path, &query), circuit_open)
            .await
            .map_err(GatewayError::from)
    }

    /// Send the request, retrying network errors and 5xx responses
    ///
    /// The first attempt's limiter token was taken by the caller; every retry
    /// takes its own and stops retrying if none is available.
    async fn request_with_retry(&self, path: &str, query: &[(&'static str, String)]) -> Result<Fetch> {
        let url = format!("{}{}", self.base_url, path);
        let mut params: Vec<(&str, String)> = query.to_vec();
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = calculate_backoff(self.retry_backoff_ms, attempt - 1);
                metrics::record_retry(path, backoff);
                debug!(endpoint = %path, attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, "Retrying after backoff");
                tokio::time::sleep(backoff).await;

                let admission = self.limiter.try_acquire(path);
                if !admission.allowed {
                    warn!(endpoint = %path, attempt = attempt + 1, "No rate limit budget for retry, giving up");
                    break;
                }
            }

            let timer = RequestTimer::start(path);
            let response = match self.client.get(&url).query(&params).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    timer.finish(if e.is_timeout() {
                        RequestOutcome::Timeout
                    } else {
                        RequestOutcome::Network
                    });
                    warn!(
                        endpoint = %path,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        error = %e,
                        "Network error"
                    );
                    last_error = Some(if e.is_timeout() {
                        GatewayError::Timeout
                    } else {
                        GatewayError::Network(e.to_string())
                    });
                    continue;
                }
            };

            let status = response.status();
            timer.finish(RequestOutcome::Status(status.as_u16()));

            if status == StatusCode::TOO_MANY_REQUESTS {
                self.limiter.drain();
                return Ok(Fetch::Denied(Denial::Throttled));
            }

            if status == StatusCode::NOT_FOUND {
                debug!(endpoint = %path, "Upstream returned 404");
                return Ok(Fetch::Absent);
            }

            if !status.is_success() {
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(MAX_ERROR_BODY);
                let err = GatewayError::Status {
                    status: status.as_u16(),
                    body,
                };

                if status.is_server_error() {
                    warn!(
                        endpoint = %path,
                        status = status.as_u16(),
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        "Server error"
                    );
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }

            return match response.json::<Value>().await {
                Ok(body) => {
                    debug!(endpoint = %path, attempt = attempt + 1, "Request succeeded");
                    Ok(Fetch::Data(body))
                }
                Err(e) if e.is_timeout() => Err(GatewayError::Timeout),
                Err(e) => Err(GatewayError::Malformed(e.to_string())),
            };
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Network("all retries exhausted".to_string())))
    }
}

#[async_trait]
impl Upstream for ApiGateway {
    async fn fetch_collection_page(&self, collection: Collection, page: PageRequest) -> Result<Fetch> {
        let (path, query) = collection_endpoint(collection, page)?;
        self.get(path, query).await
    }

    async fn fetch_entity(&self, collection: Collection, key: i64) -> Result<Fetch> {
        let (path, query) = entity_endpoint(collection, key)?;
        self.get(path, query).await
    }

    fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.breakers.all_statuses()
    }
}
