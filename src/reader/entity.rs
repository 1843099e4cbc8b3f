//! Per-key reader gated by staleness
//!
//! Keys come from the store (hero ids for rankings, referenced account ids
//! for players). Each key becomes one upstream request whose body is
//! expanded into records:
//!
//! - hero rankings: the `rankings` array, each entry tagged with `hero_id`
//! - everything else: the body itself, tagged with the key if it lacks one
//!
//! Freshness is checked per key, so a run cut short by a denial leaves the
//! unfetched keys stale for the next run. A denial ends the run, an upstream
//! failure skips only its key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{is_stale, record_id, RecordReader, Result};
use crate::gateway::{Fetch, Upstream};
use crate::storage::{FreshnessKey, StateStore};
use crate::Collection;

/// Where the keys come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Every stored id of a collection
    Stored(Collection),
    /// Account ids referenced by rankings, notable players and players
    CandidateAccounts,
    /// A fixed list
    Fixed(Vec<i64>),
}

/// Counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityReadStats {
    /// Keys considered
    pub keys: usize,
    /// Keys fetched
    pub fetched: usize,
    /// Keys skipped because they were fresh
    pub fresh: usize,
    /// Keys whose fetch failed or returned nothing usable
    pub failed: usize,
}

/// Reader fetching one upstream document per key
pub struct EntityReader {
    collection: Collection,
    keys_from: KeySource,
    expiration: Duration,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn StateStore>,
    now: Option<DateTime<Utc>>,
    keys: Option<VecDeque<i64>>,
    buffer: VecDeque<Value>,
    stats: EntityReadStats,
    exhausted: bool,
}

impl EntityReader {
    /// Create a reader for `collection`
    pub fn new(
        collection: Collection,
        keys_from: KeySource,
        expiration: Duration,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            collection,
            keys_from,
            expiration,
            upstream,
            store,
            now: None,
            keys: None,
            buffer: VecDeque::new(),
            stats: EntityReadStats::default(),
            exhausted: false,
        }
    }

    /// Evaluate staleness against a fixed clock instead of `Utc::now()`
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Counters so far
    pub fn stats(&self) -> EntityReadStats {
        self.stats
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Resolve the key list
    fn open(&self) -> Result<VecDeque<i64>> {
        let keys = match &self.keys_from {
            KeySource::Stored(source) => self.store.known_ids(*source)?,
            KeySource::CandidateAccounts => self.store.candidate_account_ids()?,
            KeySource::Fixed(keys) => keys.clone(),
        };
        info!(collection = %self.collection, keys = keys.len(), "Resolved entity keys");
        Ok(keys.into())
    }

    /// Expand one response body into records
    fn expand(&self, key: i64, body: Value) -> Vec<Value> {
        let mut records = match (self.collection, body) {
            (Collection::HeroRankings, Value::Object(mut object)) => match object.remove("rankings") {
                Some(Value::Array(rankings)) => rankings,
                _ => Vec::new(),
            },
            (_, Value::Array(items)) => items,
            (_, other) => vec![other],
        };

        // Rankings always belong to the requested hero; other records keep their own id
        let field = self.collection.id_field();
        let overwrite = self.collection == Collection::HeroRankings;
        for record in &mut records {
            let missing = record_id(record, field).is_none();
            if let Value::Object(object) = record {
                if overwrite || missing {
                    object.insert(field.to_string(), Value::from(key));
                }
            }
        }
        records
    }

    /// Process keys until something is buffered or the keys run out
    async fn fill(&mut self) -> Result<()> {
        loop {
            let Some(key) = self.keys.as_mut().and_then(|keys| keys.pop_front()) else {
                self.exhausted = true;
                debug!(collection = %self.collection, stats = ?self.stats, "Entity keys exhausted");
                return Ok(());
            };
            self.stats.keys += 1;

            let freshness = FreshnessKey::Entity(self.collection, key);
            match is_stale(self.store.as_ref(), freshness, self.expiration, self.now()) {
                Ok(true) => {}
                Ok(false) => {
                    self.stats.fresh += 1;
                    debug!(collection = %self.collection, key = key, "Entity is fresh, skipping");
                    continue;
                }
                Err(e) => {
                    self.stats.failed += 1;
                    return Err(e.into());
                }
            }

            match self.upstream.fetch_entity(self.collection, key).await {
                Ok(Fetch::Data(body)) => {
                    self.stats.fetched += 1;
                    let records = self.expand(key, body);
                    if records.is_empty() {
                        debug!(collection = %self.collection, key = key, "Response held no records");
                        continue;
                    }
                    self.buffer.extend(records);
                    return Ok(());
                }
                Ok(Fetch::Absent) => {
                    self.stats.failed += 1;
                    info!(collection = %self.collection, key = key, "Entity not found upstream");
                }
                Ok(Fetch::Denied(denial)) => {
                    info!(
                        collection = %self.collection,
                        key = key,
                        denial = %denial,
                        remaining = self.keys.as_ref().map_or(0, VecDeque::len),
                        "Request denied, deferring remaining keys to the next run"
                    );
                    self.exhausted = true;
                    return Ok(());
                }
                Err(e) => {
                    self.stats.failed += 1;
                    warn!(collection = %self.collection, key = key, error = %e, "Entity fetch failed, skipping key");
                }
            }
        }
    }
}

#[async_trait]
impl RecordReader for EntityReader {
    fn name(&self) -> &str {
        self.collection.name()
    }

    async fn next(&mut self) -> Result<Option<Value>> {
        if self.keys.is_none() {
            match self.open() {
                Ok(keys) => self.keys = Some(keys),
                Err(e) => {
                    self.keys = Some(VecDeque::new());
                    self.exhausted = true;
                    return Err(e);
                }
            }
        }

        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }
}
