//! Upstream API access
//!
//! Every upstream call goes through an [`Upstream`] implementation. The
//! production one is [`ApiGateway`], which puts each request behind the
//! shared circuit breaker and rate limiter. Readers and processors only see
//! the trait, so tests can script responses in process.

pub mod client;

pub use client::{calculate_backoff, ApiGateway, MAX_BACKOFF_MS, SERVICE_NAME};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::breaker::{BreakerError, BreakerState, BreakerStatus};
use crate::limiter::DenialReason;
use crate::Collection;

/// Which page of a collection to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageRequest {
    /// The newest page (no cursor)
    Latest,
    /// Items with id strictly less than the cursor
    LessThan(i64),
    /// A numbered page, starting at 0
    Number(u32),
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRequest::Latest => write!(f, "latest"),
            PageRequest::LessThan(id) => write!(f, "<{id}"),
            PageRequest::Number(n) => write!(f, "#{n}"),
        }
    }
}

/// Why a call was refused without reaching the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The local rate limiter had no budget
    RateLimited {
        /// Earliest time a retry could succeed
        retry_after: Duration,
        /// Window that refused
        reason: DenialReason,
    },
    /// The breaker for the service is open
    CircuitOpen {
        /// Service name
        service: String,
    },
    /// The upstream answered 429; the limiter bucket was drained
    Throttled,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::RateLimited {
                retry_after,
                reason,
            } => write!(f, "rate limited ({reason}), retry after {}ms", retry_after.as_millis()),
            Denial::CircuitOpen { service } => write!(f, "circuit breaker '{service}' is open"),
            Denial::Throttled => write!(f, "throttled by upstream (429)"),
        }
    }
}

/// Result of an upstream call that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    /// JSON body of a 2xx response
    Data(Value),
    /// The entity does not exist upstream (404)
    Absent,
    /// Admission control refused the call
    Denied(Denial),
}

/// Upstream call failures
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded its timeout
    #[error("request timed out")]
    Timeout,

    /// Non-2xx status other than 404 and 429
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// 2xx response whose body is not valid JSON
    #[error("malformed response body: {0}")]
    Malformed(String),

    /// The collection has no endpoint for this kind of request
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// A guarded call failed and was recorded by the breaker
    #[error("circuit breaker '{service}' recorded a failure (state {state}): {source}")]
    Breaker {
        /// Service name
        service: String,
        /// Breaker mode after the failure was recorded
        state: BreakerState,
        /// The failure itself
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Whether a retry within the same guarded call might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout => true,
            GatewayError::Status { status, .. } => *status >= 500,
            GatewayError::Breaker { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<BreakerError<GatewayError>> for GatewayError {
    fn from(err: BreakerError<GatewayError>) -> Self {
        GatewayError::Breaker {
            service: err.service,
            state: err.state,
            source: Box::new(err.source),
        }
    }
}

/// Result alias for upstream calls
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Upstream API surface consumed by readers and processors
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch one page of a collection
    async fn fetch_collection_page(&self, collection: Collection, page: PageRequest) -> Result<Fetch>;

    /// Fetch one entity (or per-key listing) by key
    async fn fetch_entity(&self, collection: Collection, key: i64) -> Result<Fetch>;

    /// Breaker snapshots for reporting; empty when there are no breakers
    fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        Vec::new()
    }
}

/// Endpoint path and query for a collection page
pub fn collection_endpoint(
    collection: Collection,
    page: PageRequest,
) -> Result<(String, Vec<(&'static str, String)>)> {
    match (collection, page) {
        (Collection::Heroes, _) => Ok(("/heroes".to_string(), Vec::new())),
        (Collection::NotablePlayers, _) => Ok(("/proPlayers".to_string(), Vec::new())),
        (Collection::Teams, PageRequest::Number(n)) => {
            Ok(("/teams".to_string(), vec![("page", n.to_string())]))
        }
        (Collection::Teams, _) => Ok(("/teams".to_string(), Vec::new())),
        (Collection::Matches, PageRequest::LessThan(id)) => Ok((
            "/proMatches".to_string(),
            vec![("less_than_match_id", id.to_string())],
        )),
        (Collection::Matches, _) => Ok(("/proMatches".to_string(), Vec::new())),
        (other, page) => Err(GatewayError::Unsupported(format!(
            "no collection endpoint for {other} (page {page})"
        ))),
    }
}

/// Endpoint path and query for an entity lookup
pub fn entity_endpoint(collection: Collection, key: i64) -> Result<(String, Vec<(&'static str, String)>)> {
    match collection {
        Collection::HeroRankings => Ok(("/rankings".to_string(), vec![("hero_id", key.to_string())])),
        Collection::Players => Ok((format!("/players/{key}"), Vec::new())),
        Collection::Matches => Ok((format!("/matches/{key}"), Vec::new())),
        Collection::Teams => Ok((format!("/teams/{key}"), Vec::new())),
        other => Err(GatewayError::Unsupported(format!("no entity endpoint for {other}"))),
    }
}
