//! Freshness decisions

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::storage::{self, FreshnessKey, StateStore};

/// Whether data last updated at `last_update` should be refetched at `now`
///
/// True when there is no recorded update, or `now` is strictly past
/// `last_update + expiration`.
pub fn should_fetch(last_update: Option<DateTime<Utc>>, expiration: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_update else {
        return true;
    };
    match chrono::Duration::from_std(expiration) {
        Ok(exp) => match last.checked_add_signed(exp) {
            Some(deadline) => now > deadline,
            None => false,
        },
        // Expiration beyond chrono's range never expires
        Err(_) => false,
    }
}

/// Look up the last update for `key` and apply [`should_fetch`]
pub fn is_stale(
    store: &dyn StateStore,
    key: FreshnessKey,
    expiration: Duration,
    now: DateTime<Utc>,
) -> storage::Result<bool> {
    let last = store.last_update(key)?;
    Ok(should_fetch(last, expiration, now))
}
