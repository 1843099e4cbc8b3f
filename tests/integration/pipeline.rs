//! End-to-end jobs over a scripted upstream and an in-memory store

use super::support::{match_page, ScriptedUpstream};
use gg_ingest::config::IngestConfig;
use gg_ingest::gateway::{Denial, Fetch, PageRequest};
use gg_ingest::pipeline::{JobKind, JobStatus, PipelineOrchestrator, StepKind, HISTORICAL_MATCHES_CURSOR};
use gg_ingest::shutdown::ShutdownCoordinator;
use gg_ingest::storage::{EntitySink, SqliteStore, StateStore};
use gg_ingest::{Collection, Entity, MatchDetail};
use serde_json::json;
use std::sync::Arc;

fn player_body(id: i64) -> serde_json::Value {
    json!({"profile": {"account_id": id, "steamid": format!("7656{id}"), "personaname": format!("p{id}")}})
}

/// Upstream with two heroes, one pro, one team and three pro matches
///
/// Entities listed in `denied` answer with a throttling denial instead.
fn world(denied: &[(Collection, i64)]) -> Arc<ScriptedUpstream> {
    let upstream = Arc::new(ScriptedUpstream::new());
    for (collection, key) in denied {
        upstream.entity(*collection, *key, Ok(Fetch::Denied(Denial::Throttled)));
    }
    upstream
        .data_page(
            Collection::Heroes,
            PageRequest::Latest,
            json!([
                {"id": 1, "name": "npc_dota_hero_antimage", "localized_name": "Anti-Mage"},
                {"id": 2, "name": "npc_dota_hero_axe", "localized_name": "Axe"}
            ]),
        )
        .data_entity(Collection::HeroRankings, 1, json!({"hero_id": 1, "rankings": [{"account_id": 10, "score": 900.5}]}))
        .data_entity(Collection::HeroRankings, 2, json!({"hero_id": 2, "rankings": [{"account_id": 11, "score": 850.0}]}))
        .data_page(
            Collection::NotablePlayers,
            PageRequest::Latest,
            json!([{"account_id": 20, "name": "pro", "team_id": 5}]),
        )
        .data_page(Collection::Teams, PageRequest::Number(0), json!([{"team_id": 5, "name": "Team", "tag": "T"}]))
        .data_page(Collection::Matches, PageRequest::Latest, match_page(3, 1));
    for id in [10, 11, 20] {
        if !denied.contains(&(Collection::Players, id)) {
            upstream.data_entity(Collection::Players, id, player_body(id));
        }
    }
    upstream.match_details((1..=3).filter(|id| !denied.contains(&(Collection::Matches, *id))));
    upstream
}

fn small_world() -> Arc<ScriptedUpstream> {
    world(&[])
}

fn orchestrator(upstream: Arc<ScriptedUpstream>, store: Arc<SqliteStore>, config: IngestConfig) -> PipelineOrchestrator {
    PipelineOrchestrator::with_parts(config, upstream, store.clone(), store)
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared())
}

#[tokio::test]
async fn test_full_job_fills_every_collection() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let upstream = small_world();

    let summary = orchestrator(upstream.clone(), store.clone(), IngestConfig::default())
        .run(JobKind::All)
        .await;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.steps.len(), StepKind::ALL.len());
    assert!(summary.steps.iter().all(|s| s.status == JobStatus::Completed));

    assert_eq!(store.count(Collection::Heroes).unwrap(), 2);
    assert_eq!(store.count(Collection::HeroRankings).unwrap(), 2);
    assert_eq!(store.count(Collection::NotablePlayers).unwrap(), 1);
    assert_eq!(store.count(Collection::Teams).unwrap(), 1);
    assert_eq!(store.count(Collection::Players).unwrap(), 3);
    assert_eq!(store.count(Collection::Matches).unwrap(), 3);
    assert_eq!(summary.total_written(), 12);

    // Historical backfill starts below the matches the forward step just wrote
    assert!(upstream.calls_to(Collection::Matches).contains(&"matches <1".to_string()));
    assert_eq!(store.load_cursor(HISTORICAL_MATCHES_CURSOR).unwrap(), None);
}

#[tokio::test]
async fn test_denial_defers_remaining_players() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let upstream = world(&[(Collection::Players, 11)]);

    let orchestrator = orchestrator(upstream.clone(), store.clone(), IngestConfig::default());
    orchestrator.run(JobKind::Step(StepKind::Heroes)).await;
    orchestrator.run(JobKind::Step(StepKind::HeroRankings)).await;
    orchestrator.run(JobKind::Step(StepKind::NotablePlayers)).await;
    let summary = orchestrator.run(JobKind::Step(StepKind::Players)).await;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(upstream.calls_to(Collection::Players), vec!["players 10", "players 11"]);
    assert_eq!(store.count(Collection::Players).unwrap(), 1);
}

#[tokio::test]
async fn test_denied_match_detail_is_fetched_on_next_run() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let known: MatchDetail = serde_json::from_value(json!({"match_id": 50})).unwrap();
    store.upsert(&Entity::Match(known)).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream
        .data_page(Collection::Matches, PageRequest::Latest, match_page(60, 51))
        .entity(Collection::Matches, 55, Ok(Fetch::Denied(Denial::Throttled)))
        .match_details(51..=60);

    let orchestrator = orchestrator(upstream.clone(), store.clone(), IngestConfig::default());
    let job = JobKind::Step(StepKind::NewMatches);

    let first = orchestrator.run(job).await;
    assert_eq!(first.status, JobStatus::Completed);
    let counts = &first.step(StepKind::NewMatches).unwrap().counts;
    assert_eq!((counts.read, counts.written, counts.skipped), (10, 9, 1));
    assert_eq!(counts.skipped_items[0].identity, "match_id=55");
    assert_eq!(store.count(Collection::Matches).unwrap(), 10);
    assert_eq!(store.deferred_ids(Collection::Matches).unwrap(), vec![55]);

    let second = orchestrator.run(job).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.total_written(), 1);
    assert_eq!(store.count(Collection::Matches).unwrap(), 11);
    assert!(store.deferred_ids(Collection::Matches).unwrap().is_empty());
    let detail_calls = upstream.calls_to(Collection::Matches);
    assert_eq!(detail_calls.iter().filter(|c| *c == "matches 55").count(), 2);
    assert_eq!(detail_calls.iter().filter(|c| *c == "matches 54").count(), 1);
}

#[tokio::test]
async fn test_denied_rankings_resume_on_later_runs() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let upstream = Arc::new(ScriptedUpstream::new());
    upstream
        .data_page(
            Collection::Heroes,
            PageRequest::Latest,
            json!([
                {"id": 1, "name": "npc_dota_hero_antimage", "localized_name": "Anti-Mage"},
                {"id": 2, "name": "npc_dota_hero_axe", "localized_name": "Axe"},
                {"id": 3, "name": "npc_dota_hero_bane", "localized_name": "Bane"}
            ]),
        )
        .entity(Collection::HeroRankings, 2, Ok(Fetch::Denied(Denial::Throttled)));
    for hero in 1..=3 {
        upstream.data_entity(
            Collection::HeroRankings,
            hero,
            json!({"hero_id": hero, "rankings": [{"account_id": 10 + hero, "score": 500.0}]}),
        );
    }

    let orchestrator = orchestrator(upstream.clone(), store.clone(), IngestConfig::default());
    orchestrator.run(JobKind::Step(StepKind::Heroes)).await;

    let rankings = JobKind::Step(StepKind::HeroRankings);
    assert_eq!(orchestrator.run(rankings).await.status, JobStatus::Completed);
    assert_eq!(store.known_ids(Collection::HeroRankings).unwrap(), vec![1]);

    orchestrator.run(rankings).await;
    orchestrator.run(rankings).await;
    assert_eq!(store.known_ids(Collection::HeroRankings).unwrap(), vec![1, 2, 3]);
    assert_eq!(store.count(Collection::HeroRankings).unwrap(), 3);
    assert_eq!(
        upstream.calls_to(Collection::HeroRankings),
        vec!["herorankings 1", "herorankings 2", "herorankings 2", "herorankings 3"]
    );
}

#[tokio::test]
async fn test_summary_serializes_for_reporting() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let summary = orchestrator(small_world(), store, IngestConfig::default())
        .run(JobKind::Matches)
        .await;

    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["job"], "matches");
    assert_eq!(value["status"], "Completed");
    assert_eq!(value["steps"][0]["step"], "new-matches");
    assert_eq!(value["steps"][1]["step"], "historical-matches");
    assert_eq!(value["steps"][0]["counts"]["written"], 3);
    assert!(value["breakers"].as_array().unwrap().is_empty());
}
