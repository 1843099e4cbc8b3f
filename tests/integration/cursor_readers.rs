//! Forward and backward cursor readers against a scripted upstream

use super::support::{match_page, ScriptedUpstream};
use gg_ingest::config::IngestConfig;
use gg_ingest::gateway::PageRequest;
use gg_ingest::pipeline::{JobKind, JobStatus, PipelineOrchestrator, StepKind, NEW_MATCHES_CURSOR};
use gg_ingest::reader::{CursorReader, RecordReader};
use gg_ingest::shutdown::ShutdownCoordinator;
use gg_ingest::storage::{EntitySink, SqliteStore, StateStore};
use gg_ingest::{Collection, Entity, MatchDetail};
use serde_json::{json, Value};
use std::sync::Arc;

fn stored_match(id: i64) -> Entity {
    Entity::Match(MatchDetail {
        match_id: Some(id),
        start_time: None,
        duration: None,
        radiant_win: None,
        leagueid: None,
        radiant_team_id: None,
        dire_team_id: None,
        radiant_score: None,
        dire_score: None,
        payload: json!({"match_id": id}),
    })
}

async fn drain(reader: &mut dyn RecordReader, limit: usize) -> Vec<Value> {
    let mut items = Vec::new();
    while items.len() < limit {
        match reader.next().await.unwrap() {
            Some(item) => items.push(item),
            None => break,
        }
    }
    items
}

#[tokio::test]
async fn test_historical_reader_walks_below_stored_minimum() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert(&stored_match(500)).unwrap();
    store.upsert(&stored_match(900)).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream
        .data_page(Collection::Matches, PageRequest::LessThan(500), match_page(500, 481))
        .data_page(Collection::Matches, PageRequest::LessThan(481), match_page(480, 461));

    let mut reader = CursorReader::backward("historical", Collection::Matches, upstream.clone(), store.clone(), 20);

    let items = drain(&mut reader, 40).await;
    assert_eq!(items.len(), 40);
    assert_eq!(reader.cursor(), Some(461));
    assert_eq!(store.load_cursor("historical").unwrap(), Some(461));
    assert_eq!(upstream.calls_to(Collection::Matches), vec!["matches <500", "matches <481"]);

    // The next read asks for the page below the cursor
    assert!(reader.next().await.unwrap().is_none());
    assert_eq!(
        upstream.calls_to(Collection::Matches),
        vec!["matches <500", "matches <481", "matches <461"]
    );
    assert_eq!(store.load_cursor("historical").unwrap(), Some(461));
}

#[tokio::test]
async fn test_historical_reader_resumes_from_persisted_cursor() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert(&stored_match(500)).unwrap();
    store.persist_cursor("historical", 300).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream.data_page(Collection::Matches, PageRequest::LessThan(300), match_page(299, 290));

    let mut reader = CursorReader::backward("historical", Collection::Matches, upstream.clone(), store.clone(), 20);
    assert_eq!(drain(&mut reader, 100).await.len(), 10);
    assert_eq!(store.load_cursor("historical").unwrap(), Some(290));
    assert_eq!(upstream.calls_to(Collection::Matches)[0], "matches <300");
}

#[tokio::test]
async fn test_forward_reader_resumes_interrupted_walk() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert(&stored_match(100)).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream
        .data_page(Collection::Matches, PageRequest::Latest, match_page(120, 111))
        .data_page(Collection::Matches, PageRequest::LessThan(111), match_page(110, 101))
        .data_page(Collection::Matches, PageRequest::LessThan(101), match_page(100, 91));

    let open = |store: &Arc<SqliteStore>| {
        CursorReader::forward("fresh", Collection::Matches, upstream.clone(), store.clone(), 1)
    };

    let mut first = open(&store);
    assert_eq!(drain(&mut first, 100).await.len(), 10);
    assert_eq!(store.load_cursor("fresh.floor").unwrap(), Some(100));
    assert_eq!(store.load_cursor("fresh.cursor").unwrap(), Some(111));

    let mut second = open(&store);
    let items = drain(&mut second, 100).await;
    assert_eq!(items.first().unwrap()["match_id"], 110);
    assert_eq!(second.floor(), Some(100));

    let mut third = open(&store);
    assert!(drain(&mut third, 100).await.is_empty());
    assert_eq!(store.load_cursor("fresh.floor").unwrap(), None);
    assert_eq!(store.load_cursor("fresh.cursor").unwrap(), None);
}

#[tokio::test]
async fn test_forward_run_twice_writes_nothing_new() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert(&stored_match(100)).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream
        .data_page(Collection::Matches, PageRequest::Latest, match_page(110, 101))
        .data_page(Collection::Matches, PageRequest::LessThan(101), match_page(100, 91))
        .match_details(101..=110);

    let orchestrator = PipelineOrchestrator::with_parts(IngestConfig::default(), upstream.clone(), store.clone(), store.clone())
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared());
    let job = JobKind::Step(StepKind::NewMatches);

    let first = orchestrator.run(job).await;
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.total_written(), 10);
    assert_eq!(store.count(Collection::Matches).unwrap(), 11);
    assert_eq!(store.load_cursor(&format!("{NEW_MATCHES_CURSOR}.floor")).unwrap(), None);

    let detail_calls = upstream.calls().iter().filter(|c| c.starts_with("matches 1")).count();

    let second = orchestrator.run(job).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.total_written(), 0);
    assert_eq!(second.total_read(), 0);
    assert_eq!(store.count(Collection::Matches).unwrap(), 11);
    assert_eq!(
        upstream.calls().iter().filter(|c| c.starts_with("matches 1")).count(),
        detail_calls
    );
}
