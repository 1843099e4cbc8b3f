//! Persisted rate limit counters and the window arithmetic over them

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global limiter record, persisted after every granted request
///
/// Tokens are fractional so the bucket can refill continuously at
/// `capacity / refill_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Tokens currently in the bucket
    pub tokens: f64,
    /// Last time tokens were added
    pub last_refill: DateTime<Utc>,
    /// Start of the current per-minute accounting window
    pub window_start: DateTime<Utc>,
    /// Requests granted in the current per-minute window
    pub requests_in_window: u32,
    /// Requests granted on `daily_window_start`
    pub daily_requests: u32,
    /// UTC day the daily counter belongs to
    pub daily_window_start: NaiveDate,
}

impl RateLimitState {
    /// Full bucket with both windows anchored at `now`
    pub fn fresh(now: DateTime<Utc>, capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
            window_start: now,
            requests_in_window: 0,
            daily_requests: 0,
            daily_window_start: now.date_naive(),
        }
    }

    /// Reset the daily counter if `now` falls on a later UTC day
    ///
    /// Returns true when a rollover happened.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today > self.daily_window_start {
            self.daily_window_start = today;
            self.daily_requests = 0;
            return true;
        }
        false
    }

    /// Reset the per-minute counter once `interval` has passed since its start
    pub fn roll_window(&mut self, now: DateTime<Utc>, interval: Duration) {
        let elapsed = (now - self.window_start).num_milliseconds();
        if elapsed < 0 || elapsed as u128 >= interval.as_millis() {
            self.window_start = now;
            self.requests_in_window = 0;
        }
    }

    /// Add tokens for the time elapsed since the last refill, capped at `capacity`
    pub fn refill(&mut self, now: DateTime<Utc>, capacity: u32, interval: Duration) {
        let elapsed_ms = (now - self.last_refill).num_milliseconds();
        if elapsed_ms <= 0 {
            return;
        }
        let interval_ms = interval.as_millis().max(1) as f64;
        let added = elapsed_ms as f64 * f64::from(capacity) / interval_ms;
        self.tokens = (self.tokens + added).min(f64::from(capacity));
        self.last_refill = now;
    }

    /// Time until one whole token is available, zero if one already is
    pub fn time_until_next_token(&self, capacity: u32, interval: Duration) -> Duration {
        if self.tokens >= 1.0 || capacity == 0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        let ms = (deficit * interval.as_millis() as f64 / f64::from(capacity)).ceil();
        Duration::from_millis((ms as u64).max(1))
    }
}

/// Time from `now` until the next UTC midnight
pub fn until_next_utc_day(now: DateTime<Utc>) -> Duration {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc() - now)
        .and_then(|delta| delta.to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_refill_is_continuous_and_capped() {
        let interval = Duration::from_secs(60);
        let mut state = RateLimitState::fresh(at(12, 0, 0), 60);
        state.tokens = 0.0;

        state.refill(at(12, 0, 30), 60, interval);
        assert!((state.tokens - 30.0).abs() < 1e-9);

        state.refill(at(12, 5, 0), 60, interval);
        assert_eq!(state.tokens, 60.0);
    }

    #[test]
    fn test_refill_ignores_clock_going_backwards() {
        let mut state = RateLimitState::fresh(at(12, 0, 0), 10);
        state.tokens = 2.0;
        state.refill(at(11, 0, 0), 10, Duration::from_secs(60));
        assert_eq!(state.tokens, 2.0);
        assert_eq!(state.last_refill, at(12, 0, 0));
    }

    #[test]
    fn test_time_until_next_token() {
        let interval = Duration::from_secs(60);
        let mut state = RateLimitState::fresh(at(12, 0, 0), 50);
        assert_eq!(state.time_until_next_token(50, interval), Duration::ZERO);

        state.tokens = 0.0;
        // 60s / 50 tokens = 1200ms per token
        assert_eq!(state.time_until_next_token(50, interval), Duration::from_millis(1200));

        state.tokens = 0.5;
        assert_eq!(state.time_until_next_token(50, interval), Duration::from_millis(600));
    }

    #[test]
    fn test_daily_rollover_once_per_day() {
        let mut state = RateLimitState::fresh(at(23, 59, 0), 10);
        state.daily_requests = 7;

        assert!(!state.roll_daily(at(23, 59, 59)));
        assert_eq!(state.daily_requests, 7);

        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 1).unwrap();
        assert!(state.roll_daily(tomorrow));
        assert_eq!(state.daily_requests, 0);
        assert!(!state.roll_daily(tomorrow));
    }

    #[test]
    fn test_roll_window() {
        let interval = Duration::from_secs(60);
        let mut state = RateLimitState::fresh(at(12, 0, 0), 10);
        state.requests_in_window = 4;

        state.roll_window(at(12, 0, 59), interval);
        assert_eq!(state.requests_in_window, 4);

        state.roll_window(at(12, 1, 0), interval);
        assert_eq!(state.requests_in_window, 0);
        assert_eq!(state.window_start, at(12, 1, 0));
    }

    #[test]
    fn test_until_next_utc_day() {
        assert_eq!(until_next_utc_day(at(23, 0, 0)), Duration::from_secs(3600));
        assert_eq!(until_next_utc_day(at(0, 0, 0)), Duration::from_secs(86_400));
    }
}
