//! Item processors: validate and transform one raw record
//!
//! A processor never signals "skip" by returning nothing. Every item ends as
//! exactly one [`ProcessOutcome`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::gateway::{Denial, Fetch, GatewayError, Upstream};
use crate::storage::{StateStore, StorageError};
use crate::{
    Collection, Entity, Hero, HeroRanking, MatchDetail, NotablePlayer, Player, ProMatch, Team,
    ValidationError,
};

/// Why an item was skipped
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The record failed validation
    Invalid(ValidationError),
    /// The record could not be decoded into its type
    Malformed(String),
    /// A follow-up fetch was refused by admission control
    Denied(Denial),
    /// A follow-up fetch found nothing upstream
    Absent,
}

impl SkipReason {
    /// Whether the skip counts toward the step's skip limit
    ///
    /// Denials and missing upstream resources are expected under load.
    /// Denied match details are deferred and retried on the next run.
    pub fn counts_toward_limit(&self) -> bool {
        matches!(self, SkipReason::Invalid(_) | SkipReason::Malformed(_))
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Invalid(e) => write!(f, "invalid: {e}"),
            SkipReason::Malformed(e) => write!(f, "malformed: {e}"),
            SkipReason::Denied(denial) => write!(f, "denied: {denial}"),
            SkipReason::Absent => write!(f, "not found upstream"),
        }
    }
}

/// Item-level processing failures
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A follow-up upstream call failed
    #[error("upstream call failed: {0}")]
    Upstream(#[from] GatewayError),

    /// Recording a deferred item failed
    #[error("could not defer item: {0}")]
    Storage(#[from] StorageError),
}

/// Result of processing one item
#[derive(Debug)]
pub enum ProcessOutcome {
    /// A validated entity ready for writing
    Produced(Entity),
    /// The item was skipped
    Skipped(SkipReason),
    /// Processing failed
    Failed(ProcessError),
}

/// Validates and transforms raw records into entities
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Process a single raw record
    async fn process(&self, item: Value) -> ProcessOutcome;
}

fn decode<T: DeserializeOwned>(item: Value) -> Result<T, SkipReason> {
    serde_json::from_value(item).map_err(|e| SkipReason::Malformed(e.to_string()))
}

fn checked(result: Result<(), ValidationError>) -> Result<(), SkipReason> {
    result.map_err(SkipReason::Invalid)
}

/// Decode, validate and wrap a record of `collection`
pub fn parse_entity(collection: Collection, item: Value) -> Result<Entity, SkipReason> {
    match collection {
        Collection::Heroes => {
            let hero: Hero = decode(item)?;
            checked(hero.validate())?;
            Ok(Entity::Hero(hero))
        }
        Collection::Teams => {
            let team: Team = decode(item)?;
            checked(team.validate())?;
            Ok(Entity::Team(team))
        }
        Collection::NotablePlayers => {
            let player: NotablePlayer = decode(item)?;
            checked(player.validate())?;
            Ok(Entity::NotablePlayer(player))
        }
        Collection::HeroRankings => {
            let ranking: HeroRanking = decode(item)?;
            checked(ranking.validate())?;
            Ok(Entity::HeroRanking(ranking))
        }
        Collection::Players => {
            let mut player: Player = decode(item)?;
            checked(player.validate())?;
            if player.account_id.is_none() {
                player.account_id = player.resolved_account_id().ok();
            }
            Ok(Entity::Player(player))
        }
        Collection::Matches => {
            let payload = item.clone();
            let mut detail: MatchDetail = decode(item)?;
            checked(detail.validate())?;
            detail.payload = payload;
            Ok(Entity::Match(detail))
        }
    }
}

/// Processor for records that already carry the full entity
#[derive(Debug, Clone, Copy)]
pub struct EntityProcessor {
    collection: Collection,
}

impl EntityProcessor {
    /// Processor for `collection`
    pub fn new(collection: Collection) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl ItemProcessor for EntityProcessor {
    async fn process(&self, item: Value) -> ProcessOutcome {
        match parse_entity(self.collection, item) {
            Ok(entity) => ProcessOutcome::Produced(entity),
            Err(reason) => ProcessOutcome::Skipped(reason),
        }
    }
}

/// Resolves a match summary into its full detail
///
/// A detail fetch that is denied or fails leaves the match id in the
/// store's deferred list, so the next forward run fetches it again even
/// though its cursor has moved past it.
pub struct MatchProcessor {
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn StateStore>,
}

impl MatchProcessor {
    /// Processor fetching details through `upstream` and deferring into `store`
    pub fn new(upstream: Arc<dyn Upstream>, store: Arc<dyn StateStore>) -> Self {
        Self { upstream, store }
    }

    fn defer(&self, match_id: i64, reason: &str, outcome: ProcessOutcome) -> ProcessOutcome {
        match self.store.defer(Collection::Matches, match_id, reason) {
            Ok(()) => {
                debug!(match_id = match_id, reason = reason, "Match detail deferred");
                outcome
            }
            Err(e) => ProcessOutcome::Failed(e.into()),
        }
    }
}

#[async_trait]
impl ItemProcessor for MatchProcessor {
    async fn process(&self, item: Value) -> ProcessOutcome {
        let summary: ProMatch = match decode(item) {
            Ok(summary) => summary,
            Err(reason) => return ProcessOutcome::Skipped(reason),
        };
        let match_id = match summary.validate() {
            Ok(()) => summary.match_id.unwrap_or_default(),
            Err(e) => return ProcessOutcome::Skipped(SkipReason::Invalid(e)),
        };

        match self.upstream.fetch_entity(Collection::Matches, match_id).await {
            Ok(Fetch::Data(body)) => match parse_entity(Collection::Matches, body) {
                Ok(entity) => ProcessOutcome::Produced(entity),
                Err(reason) => ProcessOutcome::Skipped(reason),
            },
            Ok(Fetch::Absent) => match self.store.clear_deferred(Collection::Matches, match_id) {
                Ok(()) => ProcessOutcome::Skipped(SkipReason::Absent),
                Err(e) => ProcessOutcome::Failed(e.into()),
            },
            Ok(Fetch::Denied(denial)) => {
                let reason = denial.to_string();
                self.defer(match_id, &reason, ProcessOutcome::Skipped(SkipReason::Denied(denial)))
            }
            Err(e) => {
                let reason = e.to_string();
                self.defer(match_id, &reason, ProcessOutcome::Failed(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PageRequest;
    use crate::storage::SqliteStore;
    use serde_json::json;

    struct Details;

    #[async_trait]
    impl Upstream for Details {
        async fn fetch_collection_page(&self, _: Collection, _: PageRequest) -> crate::gateway::Result<Fetch> {
            Err(GatewayError::Unsupported("test".into()))
        }

        async fn fetch_entity(&self, _: Collection, key: i64) -> crate::gateway::Result<Fetch> {
            match key {
                1 => Ok(Fetch::Data(json!({"match_id": 1, "duration": 2400, "radiant_win": true}))),
                2 => Ok(Fetch::Absent),
                3 => Ok(Fetch::Denied(Denial::Throttled)),
                _ => Err(GatewayError::Status { status: 500, body: String::new() }),
            }
        }
    }

    #[tokio::test]
    async fn test_entity_processor_outcomes() {
        let heroes = EntityProcessor::new(Collection::Heroes);
        let produced = heroes
            .process(json!({"id": 1, "name": "npc_dota_hero_antimage", "localized_name": "Anti-Mage"}))
            .await;
        assert!(matches!(produced, ProcessOutcome::Produced(Entity::Hero(_))));

        let invalid = heroes.process(json!({"id": -4, "name": "x", "localized_name": "y"})).await;
        assert!(matches!(
            invalid,
            ProcessOutcome::Skipped(SkipReason::Invalid(ValidationError::NonPositiveId { field: "id", .. }))
        ));

        let malformed = heroes.process(json!({"id": "abc"})).await;
        assert!(matches!(malformed, ProcessOutcome::Skipped(SkipReason::Malformed(_))));
    }

    #[test]
    fn test_player_account_id_resolved_from_profile() {
        let entity = parse_entity(
            Collection::Players,
            json!({"profile": {"account_id": 77, "steamid": "7656", "personaname": "p"}}),
        )
        .unwrap();
        match entity {
            Entity::Player(player) => assert_eq!(player.account_id, Some(77)),
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn test_match_payload_is_kept() {
        let body = json!({"match_id": 9, "players": [{"hero_id": 1}]});
        match parse_entity(Collection::Matches, body.clone()).unwrap() {
            Entity::Match(detail) => assert_eq!(detail.payload, body),
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_match_processor_outcomes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let processor = MatchProcessor::new(Arc::new(Details), store.clone());

        match processor.process(json!({"match_id": 1})).await {
            ProcessOutcome::Produced(Entity::Match(detail)) => {
                assert_eq!(detail.match_id, Some(1));
                assert_eq!(detail.duration, Some(2400));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            processor.process(json!({"match_id": 2})).await,
            ProcessOutcome::Skipped(SkipReason::Absent)
        ));
        assert!(matches!(
            processor.process(json!({"match_id": 3})).await,
            ProcessOutcome::Skipped(SkipReason::Denied(Denial::Throttled))
        ));
        assert!(matches!(
            processor.process(json!({"match_id": 4})).await,
            ProcessOutcome::Failed(ProcessError::Upstream(_))
        ));
        assert!(matches!(
            processor.process(json!({"start_time": 1})).await,
            ProcessOutcome::Skipped(SkipReason::Invalid(ValidationError::MissingField("match_id")))
        ));

        // Denied and failed details wait for the next run
        assert_eq!(store.deferred_ids(Collection::Matches).unwrap(), vec![4, 3]);
    }

    #[tokio::test]
    async fn test_absent_detail_is_no_longer_deferred() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.defer(Collection::Matches, 2, "throttled").unwrap();
        let processor = MatchProcessor::new(Arc::new(Details), store.clone());

        assert!(matches!(
            processor.process(json!({"match_id": 2})).await,
            ProcessOutcome::Skipped(SkipReason::Absent)
        ));
        assert!(store.deferred_ids(Collection::Matches).unwrap().is_empty());
    }

    #[test]
    fn test_skip_limit_accounting() {
        assert!(SkipReason::Malformed("x".into()).counts_toward_limit());
        assert!(SkipReason::Invalid(ValidationError::MissingField("id")).counts_toward_limit());
        assert!(!SkipReason::Absent.counts_toward_limit());
        assert!(!SkipReason::Denied(Denial::Throttled).counts_toward_limit());
    }
}
