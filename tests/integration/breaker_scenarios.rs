//! Circuit breaker scenarios, alone and behind the gateway

use gg_ingest::breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
use gg_ingest::config::{ApiConfig, BreakerConfig, RateLimitConfig};
use gg_ingest::gateway::{ApiGateway, Denial, Fetch, GatewayError, PageRequest, Upstream, SERVICE_NAME};
use gg_ingest::limiter::RateLimiter;
use gg_ingest::storage::SqliteStore;
use gg_ingest::Collection;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn small_window() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 2,
        success_threshold: 2,
        timeout_ms: 60_000,
        minimum_calls: 1,
        sliding_window_size: 10,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[tokio::test]
async fn test_open_breaker_returns_fallback_without_calling_primary() {
    let registry = BreakerRegistry::new(small_window());
    let invoked = AtomicU32::new(0);

    let first: Result<&str, _> = registry
        .execute(
            "opendota",
            || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err(Boom)
            },
            || "fallback",
        )
        .await;
    assert!(first.is_err());
    assert_eq!(registry.state("opendota"), Some(BreakerState::Open));

    let second = registry
        .execute(
            "opendota",
            || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Boom>("primary")
            },
            || "fallback",
        )
        .await
        .unwrap();

    assert_eq!(second, "fallback");
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let status = registry.status("opendota").unwrap();
    assert_eq!(status.total_calls, 1);
    assert_eq!(status.failure_calls, 1);
    assert_eq!(status.last_failure_reason.as_deref(), Some("boom"));
}

#[test]
fn test_minimum_calls_gate_opening() {
    let breaker = CircuitBreaker::new(
        "svc",
        BreakerConfig {
            failure_threshold: 50,
            minimum_calls: 4,
            ..small_window()
        },
    );

    breaker.record_failure("1");
    breaker.record_failure("2");
    breaker.record_failure("3");
    assert_eq!(breaker.state(), BreakerState::Closed);

    breaker.record_failure("4");
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[test]
fn test_half_open_cycle() {
    let config = BreakerConfig {
        timeout_ms: 1_000,
        ..small_window()
    };
    let breaker = CircuitBreaker::new("svc", config);
    breaker.record_failure("down");
    assert_eq!(breaker.state(), BreakerState::Open);

    let start = Instant::now();
    assert!(!breaker.can_execute_at(start));
    assert!(breaker.can_execute_at(start + Duration::from_secs(2)));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    // A failure while probing reopens and discards the streak
    breaker.record_success();
    breaker.record_failure("still down");
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(breaker.status().consecutive_successes, 0);

    assert!(breaker.can_execute_at(Instant::now() + Duration::from_secs(2)));
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.status().window_filled, 0);
}

#[test]
fn test_registry_force_and_reset() {
    let registry = BreakerRegistry::new(small_window());
    registry.force_open("opendota", "maintenance");
    assert_eq!(registry.state("opendota"), Some(BreakerState::Open));
    assert_eq!(
        registry.status("opendota").unwrap().last_failure_reason.as_deref(),
        Some("maintenance")
    );

    registry.force_close("opendota");
    assert_eq!(registry.state("opendota"), Some(BreakerState::Closed));
    assert!(registry.reset_metrics("opendota"));
    assert!(!registry.reset_metrics("unknown"));
    assert_eq!(registry.all_statuses().len(), 1);
}

#[tokio::test]
async fn test_gateway_opens_on_unreachable_upstream() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), store));
    let api = ApiConfig {
        // Nothing listens on port 1
        base_url: "http://127.0.0.1:1".to_string(),
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
        max_retries: 0,
        ..ApiConfig::default()
    };
    let gateway = ApiGateway::new(&api, BreakerRegistry::new(small_window()), limiter.clone()).unwrap();

    let first = gateway.fetch_collection_page(Collection::Heroes, PageRequest::Latest).await;
    assert!(matches!(first, Err(GatewayError::Breaker { state: BreakerState::Open, .. })));

    let second = gateway
        .fetch_entity(Collection::Players, 42)
        .await
        .unwrap();
    assert_eq!(
        second,
        Fetch::Denied(Denial::CircuitOpen {
            service: SERVICE_NAME.to_string()
        })
    );

    // The refused call never reached the limiter
    assert_eq!(limiter.status().total_requests, 1);
    let statuses = gateway.breaker_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, BreakerState::Open);
}
