//! # GG Ingest Library
//!
//! A resilient ingestion pipeline that pulls pro match statistics (heroes, teams,
//! notable players, hero rankings, player profiles and matches) from a rate-limited
//! public stats API into a local SQLite store.
//!
//! ## Features
//!
//! - **Circuit Breaking**: Per-service breakers with a sliding failure window
//! - **Dual-Window Rate Limiting**: Per-minute token bucket plus a persisted daily cap
//! - **Incremental Paging**: Cursor readers that walk forward for new matches and
//!   backward for historical backfill, resumable across runs
//! - **Staleness Gating**: Collections and entities are refetched only once expired
//! - **Chunked Processing**: Read, validate, transform and write in fixed-size chunks
//!   with a per-step skip limit
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use gg_ingest::config::IngestConfig;
//! use gg_ingest::gateway::ApiGateway;
//! use gg_ingest::pipeline::{JobKind, PipelineOrchestrator};
//! use gg_ingest::storage::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IngestConfig::default();
//! config.validate()?;
//!
//! let store = Arc::new(SqliteStore::open(&config.pipeline.database)?);
//! let gateway = Arc::new(ApiGateway::from_config(&config, store.clone())?);
//!
//! let orchestrator = PipelineOrchestrator::new(config, gateway, store)?;
//! let summary = orchestrator.run(JobKind::All).await;
//! println!("{} items written", summary.total_written());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`breaker`] - Circuit breaker state machine and per-service registry
//! - [`limiter`] - Token bucket and daily cap with persisted counters
//! - [`gateway`] - The single choke point for upstream HTTP calls
//! - [`reader`] - Cursor and staleness-aware record readers
//! - [`pipeline`] - Chunk processing, steps and job orchestration
//! - [`storage`] - State queries and entity persistence
//! - [`config`] - Configuration loading and validation

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Circuit breakers guarding upstream services
pub mod breaker;

/// CLI command implementations
pub mod cli;

/// Configuration loading and validation
pub mod config;

/// Upstream API gateway
pub mod gateway;

/// Dual-window rate limiting
pub mod limiter;

/// Prometheus metrics
pub mod metrics;

/// Chunk processing and job orchestration
pub mod pipeline;

/// Record readers
pub mod reader;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// State queries and entity persistence
pub mod storage;

/// Reason an upstream record was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required identifying field is absent or null
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A required text field is present but blank
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// A numeric id is zero or negative
    #[error("field '{field}' must be positive, got {value}")]
    NonPositiveId {
        /// Field name
        field: &'static str,
        /// Offending value
        value: i64,
    },

    /// The record does not have the expected shape
    #[error("malformed record: {0}")]
    Malformed(String),
}

fn require_positive(field: &'static str, value: Option<i64>) -> Result<i64, ValidationError> {
    match value {
        None => Err(ValidationError::MissingField(field)),
        Some(v) if v <= 0 => Err(ValidationError::NonPositiveId { field, value: v }),
        Some(v) => Ok(v),
    }
}

fn require_text(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        None => Err(ValidationError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(ValidationError::EmptyField(field)),
        Some(_) => Ok(()),
    }
}

/// Hero metadata from `/heroes`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hero {
    /// Hero id
    pub id: Option<i64>,
    /// Internal name (e.g. `npc_dota_hero_axe`)
    pub name: Option<String>,
    /// Display name
    pub localized_name: Option<String>,
    /// Primary attribute (`str`, `agi`, `int`, `all`)
    #[serde(default)]
    pub primary_attr: Option<String>,
    /// Attack type (`Melee` or `Ranged`)
    #[serde(default)]
    pub attack_type: Option<String>,
    /// Role tags
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Hero {
    /// Validate hero identity and required names
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("id", self.id)?;
        require_text("name", self.name.as_deref())?;
        require_text("localized_name", self.localized_name.as_deref())?;
        Ok(())
    }
}

/// Team summary from `/teams`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    /// Team id
    pub team_id: Option<i64>,
    /// Team rating
    #[serde(default)]
    pub rating: Option<f64>,
    /// Wins
    #[serde(default)]
    pub wins: Option<i64>,
    /// Losses
    #[serde(default)]
    pub losses: Option<i64>,
    /// Last match time (Unix seconds)
    #[serde(default)]
    pub last_match_time: Option<i64>,
    /// Team name
    #[serde(default)]
    pub name: Option<String>,
    /// Team tag
    #[serde(default)]
    pub tag: Option<String>,
    /// Logo URL
    #[serde(default)]
    pub logo_url: Option<String>,
}

impl Team {
    /// Validate team identity
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("team_id", self.team_id)?;
        Ok(())
    }
}

/// Notable (pro) player from `/proPlayers`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotablePlayer {
    /// Steam account id
    pub account_id: Option<i64>,
    /// Pro name
    #[serde(default)]
    pub name: Option<String>,
    /// ISO country code
    #[serde(default)]
    pub country_code: Option<String>,
    /// Fantasy role
    #[serde(default)]
    pub fantasy_role: Option<i64>,
    /// Current team id
    #[serde(default)]
    pub team_id: Option<i64>,
    /// Whether the player is locked to the team
    #[serde(default)]
    pub is_locked: Option<bool>,
    /// Whether the player is flagged as pro
    #[serde(default)]
    pub is_pro: Option<bool>,
}

impl NotablePlayer {
    /// Validate player identity
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("account_id", self.account_id)?;
        Ok(())
    }

    /// Pro flag, defaulting to true when upstream omits it
    pub fn is_pro(&self) -> bool {
        self.is_pro.unwrap_or(true)
    }
}

/// One ranking entry for a hero from `/rankings?hero_id=`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeroRanking {
    /// Player account id
    pub account_id: Option<i64>,
    /// Hero id (injected by the reader, upstream omits it per entry)
    pub hero_id: Option<i64>,
    /// Ranking score
    #[serde(default)]
    pub score: Option<f64>,
}

impl HeroRanking {
    /// Validate both halves of the composite key
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("account_id", self.account_id)?;
        require_positive("hero_id", self.hero_id)?;
        Ok(())
    }
}

/// Steam profile block nested in `/players/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerProfile {
    /// Steam account id
    #[serde(default)]
    pub account_id: Option<i64>,
    /// Steam id (64-bit, as a string)
    #[serde(default)]
    pub steamid: Option<String>,
    /// Persona name
    #[serde(default)]
    pub personaname: Option<String>,
    /// Avatar URL
    #[serde(default)]
    pub avatarfull: Option<String>,
    /// Profile URL
    #[serde(default)]
    pub profileurl: Option<String>,
    /// Country code
    #[serde(default)]
    pub loccountrycode: Option<String>,
    /// Whether the player has a Plus subscription
    #[serde(default)]
    pub plus: Option<bool>,
}

/// Player details from `/players/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    /// Steam account id (injected by the reader when upstream omits it)
    #[serde(default)]
    pub account_id: Option<i64>,
    /// Steam profile
    #[serde(default)]
    pub profile: Option<PlayerProfile>,
    /// Rank tier
    #[serde(default)]
    pub rank_tier: Option<i64>,
    /// Leaderboard rank
    #[serde(default)]
    pub leaderboard_rank: Option<i64>,
}

impl Player {
    /// Validate that the player can be identified and its profile is usable
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.account_id.is_none() && self.profile.is_none() {
            return Err(ValidationError::MissingField("account_id"));
        }
        if let Some(profile) = &self.profile {
            require_text("profile.steamid", profile.steamid.as_deref())?;
            require_text("profile.personaname", profile.personaname.as_deref())?;
        }
        self.resolved_account_id().map(|_| ())
    }

    /// Account id from the top level or the profile block
    pub fn resolved_account_id(&self) -> Result<i64, ValidationError> {
        let id = self
            .account_id
            .or_else(|| self.profile.as_ref().and_then(|p| p.account_id));
        require_positive("account_id", id)
    }
}

/// Pro match summary from `/proMatches`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProMatch {
    /// Match id
    pub match_id: Option<i64>,
    /// Start time (Unix seconds)
    #[serde(default)]
    pub start_time: Option<i64>,
    /// League id
    #[serde(default)]
    pub leagueid: Option<i64>,
}

impl ProMatch {
    /// Validate the match id
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("match_id", self.match_id)?;
        Ok(())
    }
}

/// Match detail from `/matches/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchDetail {
    /// Match id
    pub match_id: Option<i64>,
    /// Start time (Unix seconds)
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: Option<i64>,
    /// Whether radiant won
    #[serde(default)]
    pub radiant_win: Option<bool>,
    /// League id
    #[serde(default)]
    pub leagueid: Option<i64>,
    /// Radiant team id
    #[serde(default)]
    pub radiant_team_id: Option<i64>,
    /// Dire team id
    #[serde(default)]
    pub dire_team_id: Option<i64>,
    /// Radiant kills
    #[serde(default)]
    pub radiant_score: Option<i64>,
    /// Dire kills
    #[serde(default)]
    pub dire_score: Option<i64>,
    /// Full upstream payload
    #[serde(skip)]
    pub payload: Value,
}

impl MatchDetail {
    /// Validate the match id
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("match_id", self.match_id)?;
        Ok(())
    }
}

/// A validated, transformed record ready for upsert
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// Hero row
    Hero(Hero),
    /// Team row
    Team(Team),
    /// Notable player row
    NotablePlayer(NotablePlayer),
    /// Hero ranking row
    HeroRanking(HeroRanking),
    /// Player row
    Player(Player),
    /// Match row
    Match(MatchDetail),
}

impl Entity {
    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Hero(_) => "hero",
            Entity::Team(_) => "team",
            Entity::NotablePlayer(_) => "notable_player",
            Entity::HeroRanking(_) => "hero_ranking",
            Entity::Player(_) => "player",
            Entity::Match(_) => "match",
        }
    }

    /// Primary key rendered for logs
    pub fn key(&self) -> String {
        match self {
            Entity::Hero(h) => format!("{}", h.id.unwrap_or_default()),
            Entity::Team(t) => format!("{}", t.team_id.unwrap_or_default()),
            Entity::NotablePlayer(p) => format!("{}", p.account_id.unwrap_or_default()),
            Entity::HeroRanking(r) => format!(
                "{}:{}",
                r.hero_id.unwrap_or_default(),
                r.account_id.unwrap_or_default()
            ),
            Entity::Player(p) => p
                .resolved_account_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            Entity::Match(m) => format!("{}", m.match_id.unwrap_or_default()),
        }
    }
}

/// Upstream collection, also the unit of storage queries and expiration lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// `/heroes`
    Heroes,
    /// `/teams`
    Teams,
    /// `/proPlayers`
    NotablePlayers,
    /// `/rankings?hero_id=`
    HeroRankings,
    /// `/players/{account_id}`
    Players,
    /// `/proMatches` and `/matches/{match_id}`
    Matches,
}

impl Collection {
    /// Stable lowercase name, used for expiration lookup and logs
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Heroes => "heroes",
            Collection::Teams => "teams",
            Collection::NotablePlayers => "notableplayers",
            Collection::HeroRankings => "herorankings",
            Collection::Players => "players",
            Collection::Matches => "matches",
        }
    }

    /// JSON field holding the record id
    pub fn id_field(&self) -> &'static str {
        match self {
            Collection::Heroes => "id",
            Collection::Teams => "team_id",
            Collection::NotablePlayers | Collection::Players => "account_id",
            Collection::HeroRankings => "hero_id",
            Collection::Matches => "match_id",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Best-effort identity of a raw upstream record for skip logs
pub fn record_identity(record: &Value) -> String {
    const ID_FIELDS: [&str; 5] = ["match_id", "account_id", "team_id", "hero_id", "id"];
    ID_FIELDS
        .iter()
        .find_map(|field| record.get(field).filter(|v| !v.is_null()).map(|v| format!("{field}={v}")))
        .unwrap_or_else(|| "unidentified".to_string())
}
