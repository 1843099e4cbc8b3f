//! Dual-window rate limiting with persisted state

use chrono::{DateTime, TimeZone, Utc};
use gg_ingest::config::RateLimitConfig;
use gg_ingest::limiter::{DenialReason, RateLimiter};
use gg_ingest::storage::{SqliteStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
}

fn config(per_minute: u32, per_day: u32) -> RateLimitConfig {
    RateLimitConfig {
        requests_per_minute: per_minute,
        requests_per_day: per_day,
        refill_interval_ms: 60_000,
    }
}

#[test]
fn test_daily_cap_allows_exactly_n() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let limiter = RateLimiter::new(config(1_000, 5), store);
    let now = at(23, 0, 0);

    for i in 0..5 {
        assert!(limiter.try_acquire_at("/heroes", now).allowed, "request {i} should pass");
    }

    let denied = limiter.try_acquire_at("/heroes", now);
    assert!(!denied.allowed);
    assert_eq!(denied.reason, Some(DenialReason::DailyCap));
    assert_eq!(denied.retry_after, Duration::from_secs(3600));

    // The next UTC day starts a fresh quota
    let tomorrow = at(23, 0, 0) + chrono::Duration::hours(1);
    assert!(limiter.try_acquire_at("/heroes", tomorrow).allowed);
    assert_eq!(limiter.status_at(tomorrow).daily_requests, 1);
}

#[test]
fn test_bucket_refills_continuously() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let limiter = RateLimiter::new(config(2, 1_000), store);
    let now = at(12, 0, 0);

    assert!(limiter.try_acquire_at("/teams", now).allowed);
    assert!(limiter.try_acquire_at("/teams", now).allowed);

    let denied = limiter.try_acquire_at("/teams", now);
    assert_eq!(denied.reason, Some(DenialReason::Bucket));
    assert_eq!(denied.retry_after, Duration::from_secs(30));

    let half = limiter.try_acquire_at("/teams", at(12, 0, 15));
    assert!(!half.allowed);
    assert_eq!(half.retry_after, Duration::from_secs(15));
    assert!(limiter.try_acquire_at("/teams", at(12, 0, 30)).allowed);
}

#[test]
fn test_budget_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");
    let now = at(9, 0, 0);

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let limiter = RateLimiter::new(config(100, 3), store);
        for _ in 0..3 {
            assert!(limiter.try_acquire_at("/proMatches", now).allowed);
        }
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let persisted = store.load_rate_limit_state().unwrap().unwrap();
    assert_eq!(persisted.daily_requests, 3);

    let limiter = RateLimiter::new(config(100, 3), store);
    let denied = limiter.try_acquire_at("/proMatches", now + chrono::Duration::minutes(5));
    assert!(!denied.allowed);
    assert_eq!(denied.reason, Some(DenialReason::DailyCap));

    let status = limiter.status_at(now);
    assert_eq!(status.daily_remaining, 0);
    assert_eq!(status.total_requests, 1);
    assert_eq!(status.rejected_requests, 1);
    assert_eq!(status.until_daily_reset, Duration::from_secs(15 * 3600));
}

#[tokio::test]
async fn test_concurrent_acquisitions_never_exceed_capacity() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let limiter = Arc::new(RateLimiter::new(config(10, 1_000), store));
    let now = at(8, 0, 0);

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.try_acquire_at("/players", now).allowed })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);
}
