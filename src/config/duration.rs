//! Compact duration strings for expiration settings
//!
//! Accepts a positive integer followed by a unit: `m` (minutes), `h` (hours),
//! `d` (days), `w` (weeks), `mo` (30-day months) or `y` (365-day years).

use std::time::Duration;

use super::ConfigError;

const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 60 * MINUTE_SECS;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// Parse a duration string such as `"30m"`, `"6h"`, `"4mo"` or `"1y"`
///
/// Input is trimmed and lowercased before matching.
///
/// # Errors
/// Returns [`ConfigError::InvalidDuration`] for blank input, an unknown unit, a
/// missing or zero number, or a value that overflows.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ConfigError::InvalidDuration {
            input: input.to_string(),
            reason: "duration cannot be empty".to_string(),
        });
    }

    let split = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (digits, unit) = normalized.split_at(split);

    if digits.is_empty() {
        return Err(ConfigError::InvalidDuration {
            input: input.to_string(),
            reason: "expected a number followed by m, h, d, w, mo or y".to_string(),
        });
    }

    let value: u64 = digits.parse().map_err(|_| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: "value is too large".to_string(),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidDuration {
            input: input.to_string(),
            reason: "duration must be greater than zero".to_string(),
        });
    }

    let unit_secs = match unit {
        "m" => MINUTE_SECS,
        "h" => HOUR_SECS,
        "d" => DAY_SECS,
        "w" => 7 * DAY_SECS,
        "mo" => 30 * DAY_SECS,
        "y" => 365 * DAY_SECS,
        other => {
            return Err(ConfigError::InvalidDuration {
                input: input.to_string(),
                reason: format!("unknown unit '{other}' (expected m, h, d, w, mo or y)"),
            })
        }
    };

    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidDuration {
            input: input.to_string(),
            reason: "value is too large".to_string(),
        })
}

/// Render a duration as the largest whole unit breakdown, for logs
///
/// Produces `"3 days, 4 hours, 5 minutes"`, `"2 hours, 0 minutes"` or `"7 minutes"`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / DAY_SECS;
    let hours = (total % DAY_SECS) / HOUR_SECS;
    let minutes = (total % HOUR_SECS) / MINUTE_SECS;

    if days > 0 {
        format!("{days} days, {hours} hours, {minutes} minutes")
    } else if hours > 0 {
        format!("{hours} hours, {minutes} minutes")
    } else {
        format!("{minutes} minutes")
    }
}
