//! State queries and entity persistence
//!
//! Two narrow traits separate what the readers and the limiter need to ask
//! ([`StateStore`]) from where processed entities go ([`EntitySink`]).
//! [`SqliteStore`] implements both.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::limiter::RateLimitState;
use crate::{Collection, Entity};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File-system failure (e.g. creating the database directory)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored timestamp or date does not parse
    #[error("invalid stored timestamp '{0}'")]
    InvalidTimestamp(String),

    /// Internal mutex was poisoned by a panicked thread
    #[error("storage lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the storage layer
pub type Result<T> = std::result::Result<T, StorageError>;

/// What a freshness query is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreshnessKey {
    /// Most recent update of any row in the collection
    Collection(Collection),
    /// Last update of one entity
    Entity(Collection, i64),
}

/// Query surface consumed by readers and the rate limiter
pub trait StateStore: Send + Sync {
    /// Largest stored id in a collection
    fn max_known_id(&self, collection: Collection) -> Result<Option<i64>>;

    /// Smallest stored id in a collection
    fn min_known_id(&self, collection: Collection) -> Result<Option<i64>>;

    /// Last update time for a collection or a single entity
    fn last_update(&self, key: FreshnessKey) -> Result<Option<DateTime<Utc>>>;

    /// Every stored id in a collection, ascending
    fn known_ids(&self, collection: Collection) -> Result<Vec<i64>>;

    /// Account ids referenced by hero rankings, notable players or players, ascending
    fn candidate_account_ids(&self) -> Result<Vec<i64>>;

    /// Load a named cursor
    fn load_cursor(&self, name: &str) -> Result<Option<i64>>;

    /// Persist a named cursor
    fn persist_cursor(&self, name: &str, value: i64) -> Result<()>;

    /// Remove a named cursor
    fn clear_cursor(&self, name: &str) -> Result<()>;

    /// Remember an item whose fetch was denied or failed, to retry on a later run
    fn defer(&self, collection: Collection, id: i64, reason: &str) -> Result<()>;

    /// Deferred ids of a collection, newest first
    fn deferred_ids(&self, collection: Collection) -> Result<Vec<i64>>;

    /// Forget a deferred id
    fn clear_deferred(&self, collection: Collection, id: i64) -> Result<()>;

    /// Load the global rate limit record
    fn load_rate_limit_state(&self) -> Result<Option<RateLimitState>>;

    /// Persist the global rate limit record
    fn persist_rate_limit_state(&self, state: &RateLimitState) -> Result<()>;
}

/// Persistence sink for processed entities
pub trait EntitySink: Send + Sync {
    /// Insert or update by primary key
    fn upsert(&self, entity: &Entity) -> Result<()>;

    /// Upsert a whole chunk as one unit
    ///
    /// The default writes item by item; transactional stores override it so
    /// a failed chunk leaves nothing behind.
    fn upsert_all(&self, entities: &[Entity]) -> Result<()> {
        entities.iter().try_for_each(|entity| self.upsert(entity))
    }
}
