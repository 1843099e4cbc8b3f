//! Freshness gating of collection and per-entity readers

use super::support::ScriptedUpstream;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use gg_ingest::config::IngestConfig;
use gg_ingest::gateway::PageRequest;
use gg_ingest::pipeline::{JobKind, JobStatus, PipelineOrchestrator, StepKind};
use gg_ingest::reader::{CollectionReader, Paging, RecordReader};
use gg_ingest::shutdown::ShutdownCoordinator;
use gg_ingest::storage::SqliteStore;
use gg_ingest::{Collection, Entity, Hero, NotablePlayer, Player, PlayerProfile};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
}

fn hero(id: i64) -> Entity {
    Entity::Hero(Hero {
        id: Some(id),
        name: Some(format!("npc_dota_hero_{id}")),
        localized_name: Some(format!("Hero {id}")),
        primary_attr: None,
        attack_type: None,
        roles: Vec::new(),
    })
}

fn player(account_id: i64) -> Entity {
    Entity::Player(Player {
        account_id: Some(account_id),
        profile: Some(PlayerProfile {
            account_id: Some(account_id),
            steamid: Some(format!("7656{account_id}")),
            personaname: Some(format!("player{account_id}")),
            avatarfull: None,
            profileurl: None,
            loccountrycode: None,
            plus: None,
        }),
        rank_tier: None,
        leaderboard_rank: None,
    })
}

fn notable(account_id: i64) -> Entity {
    Entity::NotablePlayer(NotablePlayer {
        account_id: Some(account_id),
        name: Some("pro".into()),
        country_code: None,
        fantasy_role: None,
        team_id: None,
        is_locked: None,
        is_pro: Some(true),
    })
}

async fn heroes_read(store: &Arc<SqliteStore>, expiration: Duration) -> (usize, usize) {
    let upstream = Arc::new(ScriptedUpstream::new());
    upstream.data_page(
        Collection::Heroes,
        PageRequest::Latest,
        json!([{"id": 1, "name": "npc_dota_hero_antimage", "localized_name": "Anti-Mage"}]),
    );

    let mut reader = CollectionReader::new(Collection::Heroes, Paging::Single, expiration, upstream.clone(), store.clone())
        .with_clock(now());
    let mut read = 0;
    while reader.next().await.unwrap().is_some() {
        read += 1;
    }
    (read, upstream.calls_to(Collection::Heroes).len())
}

#[tokio::test]
async fn test_collection_updated_two_hours_ago() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert_at(&hero(1), now() - ChronoDuration::hours(2)).unwrap();

    assert_eq!(heroes_read(&store, HOUR).await, (1, 1));
    assert_eq!(heroes_read(&store, 3 * HOUR).await, (0, 0));
}

#[tokio::test]
async fn test_empty_collection_is_always_fetched() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    assert_eq!(heroes_read(&store, Duration::from_secs(365 * 24 * 3600)).await, (1, 1));
}

#[tokio::test]
async fn test_players_batch_fetches_only_stale_accounts() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert_at(&player(1), now() - ChronoDuration::hours(1)).unwrap();
    store.upsert_at(&player(2), now() - ChronoDuration::days(2)).unwrap();
    store.upsert_at(&notable(3), now() - ChronoDuration::hours(1)).unwrap();

    let upstream = Arc::new(ScriptedUpstream::new());
    for id in [1, 2, 3] {
        upstream.data_entity(
            Collection::Players,
            id,
            json!({"profile": {"account_id": id, "steamid": format!("7656{id}"), "personaname": format!("p{id}")}}),
        );
    }

    let orchestrator = PipelineOrchestrator::with_parts(IngestConfig::default(), upstream.clone(), store.clone(), store.clone())
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared())
        .with_clock(now());
    let summary = orchestrator.run(JobKind::Step(StepKind::Players)).await;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(upstream.calls_to(Collection::Players), vec!["players 2", "players 3"]);
    assert_eq!(summary.total_written(), 2);
    assert_eq!(store.count(Collection::Players).unwrap(), 3);
}
