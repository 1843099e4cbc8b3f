//! Whole-collection reader gated by collection staleness

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{classify, is_stale, Page, RecordReader, Result};
use crate::config::format_duration;
use crate::gateway::{PageRequest, Upstream};
use crate::storage::{FreshnessKey, StateStore};
use crate::Collection;

/// How a collection is paged upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// One request returns everything
    Single,
    /// Numbered pages from 0, stopping at the first empty page
    Numbered {
        /// Maximum pages per run
        pages: u32,
    },
}

/// Fetches a collection only when its newest stored row has expired
pub struct CollectionReader {
    collection: Collection,
    paging: Paging,
    expiration: Duration,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn StateStore>,
    now: Option<DateTime<Utc>>,
    checked: bool,
    next_page: u32,
    buffer: VecDeque<Value>,
    exhausted: bool,
}

impl CollectionReader {
    /// Create a reader for `collection`
    pub fn new(
        collection: Collection,
        paging: Paging,
        expiration: Duration,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            collection,
            paging,
            expiration,
            upstream,
            store,
            now: None,
            checked: false,
            next_page: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Evaluate staleness against a fixed clock instead of `Utc::now()`
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn check_staleness(&self) -> Result<bool> {
        let now = self.now.unwrap_or_else(Utc::now);
        let stale = is_stale(
            self.store.as_ref(),
            FreshnessKey::Collection(self.collection),
            self.expiration,
            now,
        )?;
        if !stale {
            info!(
                collection = %self.collection,
                expiration = %format_duration(self.expiration),
                "Collection is fresh, skipping fetch"
            );
        }
        Ok(stale)
    }

    async fn fetch_next(&mut self) {
        let request = match self.paging {
            Paging::Single if self.next_page == 0 => PageRequest::Latest,
            Paging::Numbered { pages } if self.next_page < pages => PageRequest::Number(self.next_page),
            _ => {
                self.exhausted = true;
                return;
            }
        };
        self.next_page += 1;

        let result = self.upstream.fetch_collection_page(self.collection, request).await;
        match classify(self.collection.name(), &request.to_string(), result) {
            Page::Items(items) if !items.is_empty() => {
                debug!(collection = %self.collection, page = %request, items = items.len(), "Fetched collection page");
                self.buffer.extend(items);
            }
            Page::Items(_) => {
                debug!(collection = %self.collection, page = %request, "Empty page, end of collection");
                self.exhausted = true;
            }
            Page::Object(object) => {
                self.buffer.push_back(object);
                self.exhausted = true;
            }
            Page::Stop => self.exhausted = true,
        }
    }
}

#[async_trait]
impl RecordReader for CollectionReader {
    fn name(&self) -> &str {
        self.collection.name()
    }

    async fn next(&mut self) -> Result<Option<Value>> {
        if !self.checked {
            self.checked = true;
            match self.check_staleness() {
                Ok(true) => {}
                Ok(false) => self.exhausted = true,
                Err(e) => {
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
            self.fetch_next().await;
        }
    }
}
