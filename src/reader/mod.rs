//! Record readers
//!
//! Every reader implements [`RecordReader`], a pull-based source of raw
//! upstream records. Variants are picked when a step is wired:
//!
//! - [`CursorReader`] pages a collection by id, backward for historical
//!   backfill or forward for new items above a stored floor
//! - [`CollectionReader`] fetches a whole collection when it is stale
//! - [`EntityReader`] fetches one upstream document per key, gated by
//!   entity or collection staleness
//!
//! Upstream failures and admission denials end a reader's sequence for the
//! current run; they are logged, never returned. Only storage failures
//! surface as [`ReadError`].

pub mod collection;
pub mod cursor;
pub mod entity;
pub mod staleness;

pub use collection::{CollectionReader, Paging};
pub use cursor::{CursorReader, Direction};
pub use entity::{EntityReader, KeySource};
pub use staleness::{is_stale, should_fetch};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::gateway::{Fetch, GatewayError};
use crate::storage::StorageError;

/// Reader failures
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// A storage query failed
    #[error("storage error while reading: {0}")]
    Storage(#[from] StorageError),

    /// The upstream call failed in a way the reader could not absorb
    #[error("upstream error while reading: {0}")]
    Upstream(#[from] GatewayError),
}

/// Result alias for readers
pub type Result<T> = std::result::Result<T, ReadError>;

/// Pull-based source of raw upstream records
#[async_trait]
pub trait RecordReader: Send {
    /// Name used in logs and summaries
    fn name(&self) -> &str;

    /// Next record, or `None` once the source is exhausted for this run
    ///
    /// After an `Err` the reader has moved past the failing item, so the
    /// caller may keep calling.
    async fn next(&mut self) -> Result<Option<Value>>;
}

/// Extract an integer id from a record field
///
/// Accepts JSON numbers and numeric strings.
pub fn record_id(record: &Value, field: &str) -> Option<i64> {
    match record.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// What a reader does with one fetch result
pub(crate) enum Page {
    /// The body was a JSON array
    Items(Vec<Value>),
    /// The body was a JSON object
    Object(Value),
    /// Nothing usable this run; the reason was logged
    Stop,
}

/// Classify a fetch result, logging why a reader stops
pub(crate) fn classify(reader: &str, request: &str, result: std::result::Result<Fetch, GatewayError>) -> Page {
    match result {
        Ok(Fetch::Data(Value::Array(items))) => Page::Items(items),
        Ok(Fetch::Data(value @ Value::Object(_))) => Page::Object(value),
        Ok(Fetch::Data(other)) => {
            warn!(
                reader = reader,
                request = request,
                kind = json_kind(&other),
                "Unexpected response shape, stopping"
            );
            Page::Stop
        }
        Ok(Fetch::Absent) => {
            info!(reader = reader, request = request, "Upstream has no such resource");
            Page::Stop
        }
        Ok(Fetch::Denied(denial)) => {
            info!(reader = reader, request = request, denial = %denial, "Request denied, no data this run");
            Page::Stop
        }
        Err(e) => {
            warn!(reader = reader, request = request, error = %e, "Upstream fetch failed, stopping");
            Page::Stop
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
