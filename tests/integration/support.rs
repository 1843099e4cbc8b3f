//! Scripted in-process upstream shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use gg_ingest::gateway::{Fetch, GatewayError, PageRequest, Result, Upstream};
use gg_ingest::Collection;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Upstream answering from scripted pages and entities
///
/// Unscripted pages answer with an empty array, unscripted entities with
/// [`Fetch::Absent`]. Every call is logged as `"<collection> <request>"`.
#[derive(Default)]
pub struct ScriptedUpstream {
    pages: Mutex<HashMap<(Collection, PageRequest), VecDeque<Result<Fetch>>>>,
    entities: Mutex<HashMap<(Collection, i64), VecDeque<Result<Fetch>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, collection: Collection, request: PageRequest, result: Result<Fetch>) -> &Self {
        self.pages
            .lock()
            .unwrap()
            .entry((collection, request))
            .or_default()
            .push_back(result);
        self
    }

    pub fn data_page(&self, collection: Collection, request: PageRequest, body: Value) -> &Self {
        self.page(collection, request, Ok(Fetch::Data(body)))
    }

    pub fn entity(&self, collection: Collection, key: i64, result: Result<Fetch>) -> &Self {
        self.entities
            .lock()
            .unwrap()
            .entry((collection, key))
            .or_default()
            .push_back(result);
        self
    }

    pub fn data_entity(&self, collection: Collection, key: i64, body: Value) -> &Self {
        self.entity(collection, key, Ok(Fetch::Data(body)))
    }

    /// Script `/matches/{id}` for every id in `ids`
    pub fn match_details(&self, ids: impl IntoIterator<Item = i64>) -> &Self {
        for id in ids {
            self.data_entity(Collection::Matches, id, json!({"match_id": id, "duration": 2000 + id}));
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, collection: Collection) -> Vec<String> {
        let prefix = format!("{collection} ");
        self.calls().into_iter().filter(|c| c.starts_with(&prefix)).collect()
    }

    fn next<K: std::hash::Hash + Eq>(
        map: &Mutex<HashMap<K, VecDeque<Result<Fetch>>>>,
        key: K,
        default: Fetch,
    ) -> Result<Fetch> {
        let mut map = map.lock().unwrap();
        match map.get_mut(&key) {
            // The last scripted answer repeats
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => match queue.front() {
                Some(Ok(fetch)) => Ok(fetch.clone()),
                Some(Err(e)) => Err(GatewayError::Network(e.to_string())),
                None => Ok(default),
            },
            None => Ok(default),
        }
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn fetch_collection_page(&self, collection: Collection, page: PageRequest) -> Result<Fetch> {
        self.calls.lock().unwrap().push(format!("{collection} {page}"));
        Self::next(&self.pages, (collection, page), Fetch::Data(json!([])))
    }

    async fn fetch_entity(&self, collection: Collection, key: i64) -> Result<Fetch> {
        self.calls.lock().unwrap().push(format!("{collection} {key}"));
        Self::next(&self.entities, (collection, key), Fetch::Absent)
    }
}

/// Match summaries with ids from `high` down to `low`, inclusive
pub fn match_page(high: i64, low: i64) -> Value {
    Value::Array((low..=high).rev().map(|id| json!({"match_id": id})).collect())
}
