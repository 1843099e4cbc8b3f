//! Prometheus metrics for the ingestion pipeline
//!
//! Recorders cover the four places that make decisions about upstream
//! traffic: the gateway (requests, retries), the breaker (transitions,
//! rejections), the limiter (admissions, denials) and the pipeline steps
//! (items by outcome, step duration).
//!
//! Every recorder is safe to call before [`init_metrics`]; without an
//! installed recorder the `metrics` macros are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

use crate::breaker::BreakerState;
use crate::limiter::DenialReason;
use crate::pipeline::JobStatus;

/// Upstream requests by endpoint and outcome
pub const UPSTREAM_REQUESTS: &str = "gg_upstream_requests_total";
/// Upstream request latency
pub const UPSTREAM_LATENCY: &str = "gg_upstream_request_seconds";
/// 429 responses by endpoint
pub const UPSTREAM_THROTTLED: &str = "gg_upstream_throttled_total";
/// Retries by endpoint
pub const UPSTREAM_RETRIES: &str = "gg_upstream_retries_total";
/// Backoff slept before a retry
pub const UPSTREAM_BACKOFF: &str = "gg_upstream_backoff_seconds";
/// Breaker transitions by service and states
pub const BREAKER_TRANSITIONS: &str = "gg_breaker_transitions_total";
/// Current breaker state by service
pub const BREAKER_STATE: &str = "gg_breaker_state";
/// Calls short-circuited by an open breaker
pub const BREAKER_REJECTIONS: &str = "gg_breaker_rejections_total";
/// Limiter admissions by endpoint
pub const LIMITER_ALLOWED: &str = "gg_limiter_allowed_total";
/// Limiter denials by endpoint and reason
pub const LIMITER_DENIED: &str = "gg_limiter_denied_total";
/// Limiter state load or persist failures
pub const LIMITER_STORE_ERRORS: &str = "gg_limiter_store_errors_total";
/// Pipeline items by step and outcome
pub const STEP_ITEMS: &str = "gg_step_items_total";
/// Step wall time by step and final status
pub const STEP_DURATION: &str = "gg_step_seconds";

enum Kind {
    Counter,
    Gauge,
    Histogram,
}

const DESCRIPTIONS: &[(Kind, &str, Unit, &str)] = &[
    (Kind::Counter, UPSTREAM_REQUESTS, Unit::Count, "Upstream HTTP requests by endpoint and outcome"),
    (Kind::Histogram, UPSTREAM_LATENCY, Unit::Seconds, "Upstream HTTP request latency"),
    (Kind::Counter, UPSTREAM_THROTTLED, Unit::Count, "Upstream 429 responses"),
    (Kind::Counter, UPSTREAM_RETRIES, Unit::Count, "Upstream request retries"),
    (Kind::Histogram, UPSTREAM_BACKOFF, Unit::Seconds, "Backoff slept before a retry"),
    (Kind::Counter, BREAKER_TRANSITIONS, Unit::Count, "Circuit breaker state transitions"),
    (Kind::Gauge, BREAKER_STATE, Unit::Count, "Breaker state (0 closed, 1 half-open, 2 open)"),
    (Kind::Counter, BREAKER_REJECTIONS, Unit::Count, "Calls short-circuited by an open breaker"),
    (Kind::Counter, LIMITER_ALLOWED, Unit::Count, "Requests admitted by the rate limiter"),
    (Kind::Counter, LIMITER_DENIED, Unit::Count, "Requests denied by the rate limiter"),
    (Kind::Counter, LIMITER_STORE_ERRORS, Unit::Count, "Limiter state load or persist failures"),
    (Kind::Counter, STEP_ITEMS, Unit::Count, "Pipeline items by step and outcome"),
    (Kind::Histogram, STEP_DURATION, Unit::Seconds, "Pipeline step wall time"),
];

static EXPORTER: OnceCell<SocketAddr> = OnceCell::new();

/// Install the Prometheus recorder with a scrape endpoint on `addr`
///
/// Must run inside a Tokio runtime. Only the first call installs; later
/// calls return the address already serving.
///
/// # Errors
/// Returns the exporter's [`BuildError`] if the listener or the global
/// recorder cannot be installed.
pub fn init_metrics(addr: SocketAddr) -> Result<SocketAddr, BuildError> {
    EXPORTER
        .get_or_try_init(|| {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            for (kind, name, unit, description) in DESCRIPTIONS {
                match kind {
                    Kind::Counter => describe_counter!(*name, *unit, *description),
                    Kind::Gauge => describe_gauge!(*name, *unit, *description),
                    Kind::Histogram => describe_histogram!(*name, *unit, *description),
                }
            }
            info!(addr = %addr, "Prometheus exporter installed");
            Ok(addr)
        })
        .copied()
}

/// Address of the installed exporter, if any
pub fn exporter_addr() -> Option<SocketAddr> {
    EXPORTER.get().copied()
}

/// How an upstream request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A response arrived with this status
    Status(u16),
    /// The request timed out
    Timeout,
    /// The connection failed
    Network,
}

impl RequestOutcome {
    fn label(self) -> String {
        match self {
            RequestOutcome::Status(status) => status.to_string(),
            RequestOutcome::Timeout => "timeout".to_string(),
            RequestOutcome::Network => "network_error".to_string(),
        }
    }
}

/// Latency and outcome of one upstream attempt
pub struct RequestTimer {
    endpoint: String,
    started: Instant,
}

impl RequestTimer {
    /// Start timing a request to `endpoint`
    pub fn start(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            started: Instant::now(),
        }
    }

    /// Record the attempt
    pub fn finish(self, outcome: RequestOutcome) {
        counter!(UPSTREAM_REQUESTS, "endpoint" => self.endpoint.clone(), "outcome" => outcome.label()).increment(1);
        histogram!(UPSTREAM_LATENCY, "endpoint" => self.endpoint.clone()).record(self.started.elapsed().as_secs_f64());
        if outcome == RequestOutcome::Status(429) {
            counter!(UPSTREAM_THROTTLED, "endpoint" => self.endpoint).increment(1);
        }
    }
}

/// Record a retry of `endpoint` after sleeping `backoff`
pub fn record_retry(endpoint: &str, backoff: Duration) {
    counter!(UPSTREAM_RETRIES, "endpoint" => endpoint.to_string()).increment(1);
    histogram!(UPSTREAM_BACKOFF).record(backoff.as_secs_f64());
}

/// Record a breaker state change
pub fn record_breaker_transition(service: &str, from: BreakerState, to: BreakerState) {
    counter!(
        BREAKER_TRANSITIONS,
        "service" => service.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string(),
    )
    .increment(1);
    gauge!(BREAKER_STATE, "service" => service.to_string()).set(to.as_gauge());
}

/// Record a call rejected by an open breaker
pub fn record_breaker_rejection(service: &str) {
    counter!(BREAKER_REJECTIONS, "service" => service.to_string()).increment(1);
}

/// Record a request admitted by the limiter
pub fn record_rate_limit_allowed(endpoint: &str) {
    counter!(LIMITER_ALLOWED, "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a request denied by the limiter
pub fn record_rate_limit_denied(endpoint: &str, reason: DenialReason) {
    counter!(LIMITER_DENIED, "endpoint" => endpoint.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record a failed load or persist of limiter state
pub fn record_rate_limit_persistence_error(stage: &'static str) {
    counter!(LIMITER_STORE_ERRORS, "stage" => stage).increment(1);
}

/// Item counters and wall time of one pipeline step
pub struct StepMetrics {
    step: String,
    started: Instant,
}

impl StepMetrics {
    /// Start tracking `step`
    pub fn start(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            started: Instant::now(),
        }
    }

    /// Count items by outcome (`read`, `written`, `skipped`, `failed`)
    pub fn record_items(&self, outcome: &'static str, count: u64) {
        if count > 0 {
            counter!(STEP_ITEMS, "step" => self.step.clone(), "outcome" => outcome).increment(count);
        }
    }

    /// Record the step's wall time under its final status
    pub fn finish(&self, status: JobStatus) {
        histogram!(STEP_DURATION, "step" => self.step.clone(), "status" => status.to_string())
            .record(self.started.elapsed().as_secs_f64());
    }
}
