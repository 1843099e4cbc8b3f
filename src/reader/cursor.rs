//! Id-cursor paging over a collection
//!
//! The upstream only pages backward ("ids less than X"), so both directions
//! walk pages newest to oldest and move the cursor to the smallest id seen.
//! What differs is where the walk starts and when it stops:
//!
//! - [`Direction::Backward`] starts below the smallest stored id (or the
//!   persisted cursor) and keeps going until the upstream runs dry
//! - [`Direction::Forward`] starts at the newest page, keeps only ids above
//!   the largest stored id captured at open, and stops at the first page
//!   where nothing passes that floor
//!
//! Cursors are flushed to the store after every page, and a failed flush
//! ends the read with an error before the page is handed out. A forward walk
//! also checkpoints its floor so an interrupted run resumes with the same
//! bound; both checkpoints are cleared when the walk completes.
//!
//! Ids the processor deferred on an earlier run (denied or failed detail
//! fetches) sit below the floor, so a forward reader hands them out first,
//! before its first page.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{classify, record_id, Page, RecordReader, Result};
use crate::gateway::{PageRequest, Upstream};
use crate::storage::StateStore;
use crate::Collection;

/// Paging strategy of a [`CursorReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Historical backfill below the stored minimum
    Backward,
    /// New items above the stored maximum
    Forward,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    cursor: Option<i64>,
    floor: i64,
}

/// Restartable reader over an id-paged collection
pub struct CursorReader {
    name: String,
    collection: Collection,
    direction: Direction,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn StateStore>,
    max_pages: u32,
    position: Option<Position>,
    buffer: VecDeque<Value>,
    pages_fetched: u32,
    exhausted: bool,
}

impl CursorReader {
    /// Backward reader persisting its cursor under `name`
    pub fn backward(
        name: impl Into<String>,
        collection: Collection,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
        max_pages: u32,
    ) -> Self {
        Self::new(name, collection, Direction::Backward, upstream, store, max_pages)
    }

    /// Forward reader checkpointing under `name`
    pub fn forward(
        name: impl Into<String>,
        collection: Collection,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
        max_pages: u32,
    ) -> Self {
        Self::new(name, collection, Direction::Forward, upstream, store, max_pages)
    }

    fn new(
        name: impl Into<String>,
        collection: Collection,
        direction: Direction,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
        max_pages: u32,
    ) -> Self {
        Self {
            name: name.into(),
            collection,
            direction,
            upstream,
            store,
            max_pages: max_pages.max(1),
            position: None,
            buffer: VecDeque::new(),
            pages_fetched: 0,
            exhausted: false,
        }
    }

    /// Paging direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current cursor, once opened
    pub fn cursor(&self) -> Option<i64> {
        self.position.and_then(|p| p.cursor)
    }

    /// Floor captured by a forward reader
    pub fn floor(&self) -> Option<i64> {
        match self.direction {
            Direction::Forward => self.position.map(|p| p.floor),
            Direction::Backward => None,
        }
    }

    /// Pages fetched this run
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    fn cursor_key(&self) -> String {
        match self.direction {
            Direction::Backward => self.name.clone(),
            Direction::Forward => format!("{}.cursor", self.name),
        }
    }

    fn floor_key(&self) -> String {
        format!("{}.floor", self.name)
    }

    /// Resolve the starting position; `None` means there is nothing to do
    fn open(&self) -> Result<Option<Position>> {
        match self.direction {
            Direction::Backward => {
                let cursor = match self.store.load_cursor(&self.cursor_key())? {
                    Some(cursor) => Some(cursor),
                    None => self.store.min_known_id(self.collection)?,
                };
                let Some(cursor) = cursor else {
                    info!(reader = %self.name, "No stored items to backfill from");
                    return Ok(None);
                };
                info!(reader = %self.name, cursor = cursor, "Opened backward cursor");
                Ok(Some(Position {
                    cursor: Some(cursor),
                    floor: 0,
                }))
            }
            Direction::Forward => {
                let resumed_floor = self.store.load_cursor(&self.floor_key())?;
                let floor = match resumed_floor {
                    Some(floor) => floor,
                    None => {
                        let floor = self.store.max_known_id(self.collection)?.unwrap_or(0);
                        self.store.persist_cursor(&self.floor_key(), floor)?;
                        floor
                    }
                };
                let cursor = match resumed_floor {
                    Some(_) => self.store.load_cursor(&self.cursor_key())?,
                    None => None,
                };
                info!(
                    reader = %self.name,
                    floor = floor,
                    cursor = ?cursor,
                    resumed = resumed_floor.is_some(),
                    "Opened forward cursor"
                );
                Ok(Some(Position { cursor, floor }))
            }
        }
    }

    /// Fetch the next page into the buffer, or mark the reader exhausted
    async fn fetch_page(&mut self) -> Result<()> {
        let Some(mut position) = self.position else {
            self.exhausted = true;
            return Ok(());
        };

        if self.pages_fetched >= self.max_pages {
            info!(reader = %self.name, pages = self.pages_fetched, "Page cap reached for this run");
            self.exhausted = true;
            return Ok(());
        }

        let request = match position.cursor {
            Some(cursor) => PageRequest::LessThan(cursor),
            None => PageRequest::Latest,
        };
        let result = self.upstream.fetch_collection_page(self.collection, request).await;
        self.pages_fetched += 1;

        let items = match classify(&self.name, &request.to_string(), result) {
            Page::Items(items) => items,
            Page::Object(_) => {
                warn!(reader = %self.name, request = %request, "Expected a page array, got an object");
                self.exhausted = true;
                return Ok(());
            }
            Page::Stop => {
                self.exhausted = true;
                return Ok(());
            }
        };

        if items.is_empty() {
            info!(reader = %self.name, request = %request, "Empty page, end of collection");
            return self.complete();
        }

        let id_field = self.collection.id_field();
        let page_min = items.iter().filter_map(|item| record_id(item, id_field)).min();
        let Some(page_min) = page_min else {
            warn!(reader = %self.name, request = %request, "Page has no usable ids, stopping");
            self.exhausted = true;
            return Ok(());
        };

        if let Some(cursor) = position.cursor {
            if page_min >= cursor {
                warn!(
                    reader = %self.name,
                    cursor = cursor,
                    page_min = page_min,
                    "Page did not advance the cursor, stopping"
                );
                self.exhausted = true;
                return Ok(());
            }
        }

        let page_len = items.len();
        let accepted: Vec<Value> = match self.direction {
            Direction::Backward => items,
            Direction::Forward => items
                .into_iter()
                .filter(|item| record_id(item, id_field).is_some_and(|id| id > position.floor))
                .collect(),
        };

        if accepted.is_empty() {
            info!(
                reader = %self.name,
                floor = position.floor,
                page_min = page_min,
                "No items above floor, caught up"
            );
            return self.complete();
        }

        self.store.persist_cursor(&self.cursor_key(), page_min)?;
        position.cursor = Some(page_min);
        self.position = Some(position);

        debug!(
            reader = %self.name,
            page = self.pages_fetched,
            received = page_len,
            accepted = accepted.len(),
            cursor = page_min,
            "Fetched page"
        );
        self.buffer.extend(accepted);
        Ok(())
    }

    /// Queue ids deferred by earlier runs ahead of the first page
    fn requeue_deferred(&mut self) -> Result<()> {
        let ids = self.store.deferred_ids(self.collection)?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(reader = %self.name, count = ids.len(), "Retrying deferred items");
        let id_field = self.collection.id_field();
        for id in ids {
            let mut record = serde_json::Map::new();
            record.insert(id_field.to_string(), Value::from(id));
            self.buffer.push_back(Value::Object(record));
        }
        Ok(())
    }

    /// The walk reached its natural end
    fn complete(&mut self) -> Result<()> {
        self.exhausted = true;
        if self.direction == Direction::Forward {
            self.store.clear_cursor(&self.cursor_key())?;
            self.store.clear_cursor(&self.floor_key())?;
            debug!(reader = %self.name, "Cleared forward checkpoints");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordReader for CursorReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }

            if self.position.is_none() {
                let opened = self.open().and_then(|position| {
                    if position.is_some() && self.direction == Direction::Forward {
                        self.requeue_deferred()?;
                    }
                    Ok(position)
                });
                match opened {
                    Ok(Some(position)) => self.position = Some(position),
                    Ok(None) => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    Err(e) => {
                        self.exhausted = true;
                        return Err(e);
                    }
                }
            }

            if let Err(e) = self.fetch_page().await {
                self.exhausted = true;
                return Err(e);
            }
        }
    }
}
