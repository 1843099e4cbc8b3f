//! SQLite-backed implementation of [`StateStore`] and [`EntitySink`]
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are stored
//! as fixed-width RFC 3339 UTC strings so `MAX()` orders them correctly.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, trace};

use super::{EntitySink, FreshnessKey, Result, StateStore, StorageError};
use crate::limiter::RateLimitState;
use crate::{Collection, Entity};

/// Row key of the single global limiter record
const GLOBAL_RATE_LIMIT_KEY: &str = "GLOBAL";

/// Date format for the daily window column
const DATE_FMT: &str = "%Y-%m-%d";

/// Idempotent DDL for entity and state tables
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS heroes (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    localized_name TEXT NOT NULL,
    primary_attr TEXT,
    attack_type TEXT,
    roles TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS teams (
    team_id INTEGER PRIMARY KEY,
    rating REAL,
    wins INTEGER,
    losses INTEGER,
    last_match_time INTEGER,
    name TEXT,
    tag TEXT,
    logo_url TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notable_players (
    account_id INTEGER PRIMARY KEY,
    name TEXT,
    country_code TEXT,
    fantasy_role INTEGER,
    team_id INTEGER,
    is_locked INTEGER NOT NULL DEFAULT 0,
    is_pro INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hero_rankings (
    hero_id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    score REAL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (hero_id, account_id)
);

CREATE TABLE IF NOT EXISTS players (
    account_id INTEGER PRIMARY KEY,
    steam_id TEXT,
    personaname TEXT,
    avatar_full TEXT,
    profile_url TEXT,
    country_code TEXT,
    plus INTEGER,
    rank_tier INTEGER,
    leaderboard_rank INTEGER,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS matches (
    match_id INTEGER PRIMARY KEY,
    start_time INTEGER,
    duration INTEGER,
    radiant_win INTEGER,
    league_id INTEGER,
    radiant_team_id INTEGER,
    dire_team_id INTEGER,
    radiant_score INTEGER,
    dire_score INTEGER,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cursors (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deferred (
    collection TEXT NOT NULL,
    id INTEGER NOT NULL,
    reason TEXT NOT NULL,
    deferred_at TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS rate_limit_state (
    endpoint TEXT PRIMARY KEY,
    tokens REAL NOT NULL,
    last_refill TEXT NOT NULL,
    window_start TEXT NOT NULL,
    requests_in_window INTEGER NOT NULL,
    daily_requests INTEGER NOT NULL,
    daily_window_start TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hero_rankings_account ON hero_rankings (account_id);
";

fn table_for(collection: Collection) -> (&'static str, &'static str) {
    match collection {
        Collection::Heroes => ("heroes", "id"),
        Collection::Teams => ("teams", "team_id"),
        Collection::NotablePlayers => ("notable_players", "account_id"),
        Collection::HeroRankings => ("hero_rankings", "hero_id"),
        Collection::Players => ("players", "account_id"),
        Collection::Matches => ("matches", "match_id"),
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

fn write_entity(conn: &Connection, entity: &Entity, ts: &str) -> Result<()> {
    match entity {
        Entity::Hero(hero) => {
            conn.execute(
                "INSERT INTO heroes (id, name, localized_name, primary_attr, attack_type, roles, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    localized_name = excluded.localized_name,
                    primary_attr = excluded.primary_attr,
                    attack_type = excluded.attack_type,
                    roles = excluded.roles,
                    updated_at = excluded.updated_at",
                params![
                    hero.id,
                    hero.name,
                    hero.localized_name,
                    hero.primary_attr,
                    hero.attack_type,
                    serde_json::to_string(&hero.roles)?,
                    ts
                ],
            )?;
        }
        Entity::Team(team) => {
            conn.execute(
                "INSERT INTO teams (team_id, rating, wins, losses, last_match_time, name, tag, logo_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(team_id) DO UPDATE SET
                    rating = excluded.rating,
                    wins = excluded.wins,
                    losses = excluded.losses,
                    last_match_time = excluded.last_match_time,
                    name = excluded.name,
                    tag = excluded.tag,
                    logo_url = excluded.logo_url,
                    updated_at = excluded.updated_at",
                params![
                    team.team_id,
                    team.rating,
                    team.wins,
                    team.losses,
                    team.last_match_time,
                    team.name,
                    team.tag,
                    team.logo_url,
                    ts
                ],
            )?;
        }
        Entity::NotablePlayer(player) => {
            conn.execute(
                "INSERT INTO notable_players (account_id, name, country_code, fantasy_role, team_id, is_locked, is_pro, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(account_id) DO UPDATE SET
                    name = excluded.name,
                    country_code = excluded.country_code,
                    fantasy_role = excluded.fantasy_role,
                    team_id = excluded.team_id,
                    is_locked = excluded.is_locked,
                    is_pro = excluded.is_pro,
                    updated_at = excluded.updated_at",
                params![
                    player.account_id,
                    player.name,
                    player.country_code,
                    player.fantasy_role,
                    player.team_id,
                    player.is_locked.unwrap_or(false),
                    player.is_pro(),
                    ts
                ],
            )?;
        }
        Entity::HeroRanking(ranking) => {
            conn.execute(
                "INSERT INTO hero_rankings (hero_id, account_id, score, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(hero_id, account_id) DO UPDATE SET
                    score = excluded.score,
                    updated_at = excluded.updated_at",
                params![ranking.hero_id, ranking.account_id, ranking.score, ts],
            )?;
        }
        Entity::Player(player) => {
            let account_id = player.resolved_account_id().ok();
            let profile = player.profile.as_ref();
            conn.execute(
                "INSERT INTO players (account_id, steam_id, personaname, avatar_full, profile_url, country_code, plus, rank_tier, leaderboard_rank, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(account_id) DO UPDATE SET
                    steam_id = excluded.steam_id,
                    personaname = excluded.personaname,
                    avatar_full = excluded.avatar_full,
                    profile_url = excluded.profile_url,
                    country_code = excluded.country_code,
                    plus = excluded.plus,
                    rank_tier = excluded.rank_tier,
                    leaderboard_rank = excluded.leaderboard_rank,
                    updated_at = excluded.updated_at",
                params![
                    account_id,
                    profile.and_then(|p| p.steamid.clone()),
                    profile.and_then(|p| p.personaname.clone()),
                    profile.and_then(|p| p.avatarfull.clone()),
                    profile.and_then(|p| p.profileurl.clone()),
                    profile.and_then(|p| p.loccountrycode.clone()),
                    profile.and_then(|p| p.plus),
                    player.rank_tier,
                    player.leaderboard_rank,
                    ts
                ],
            )?;
        }
        Entity::Match(detail) => {
            conn.execute(
                "INSERT INTO matches (match_id, start_time, duration, radiant_win, league_id, radiant_team_id, dire_team_id, radiant_score, dire_score, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(match_id) DO UPDATE SET
                    start_time = excluded.start_time,
                    duration = excluded.duration,
                    radiant_win = excluded.radiant_win,
                    league_id = excluded.league_id,
                    radiant_team_id = excluded.radiant_team_id,
                    dire_team_id = excluded.dire_team_id,
                    radiant_score = excluded.radiant_score,
                    dire_score = excluded.dire_score,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    detail.match_id,
                    detail.start_time,
                    detail.duration,
                    detail.radiant_win,
                    detail.leagueid,
                    detail.radiant_team_id,
                    detail.dire_team_id,
                    detail.radiant_score,
                    detail.dire_score,
                    serde_json::to_string(&detail.payload)?,
                    ts
                ],
            )?;
            conn.execute(
                "DELETE FROM deferred WHERE collection = ?1 AND id = ?2",
                params![Collection::Matches.name(), detail.match_id],
            )?;
        }
    }

    trace!(kind = entity.kind(), key = %entity.key(), "Upserted entity");
    Ok(())
}

/// SQLite-backed store
///
/// Create with [`SqliteStore::open`] for file-backed persistence or
/// [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        info!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Upsert with an explicit `updated_at`
    pub fn upsert_at(&self, entity: &Entity, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        write_entity(&conn, entity, &format_ts(now))
    }

    /// Upsert a chunk in one transaction with an explicit `updated_at`
    pub fn upsert_all_at(&self, entities: &[Entity], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let ts = format_ts(now);
        let tx = conn.transaction()?;
        for entity in entities {
            write_entity(&tx, entity, &ts)?;
        }
        tx.commit()?;
        debug!(count = entities.len(), "Committed chunk");
        Ok(())
    }

    /// Persist a cursor with an explicit `updated_at`
    pub fn persist_cursor_at(&self, name: &str, value: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO cursors (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, value, format_ts(now)],
        )?;
        Ok(())
    }

    /// Every stored cursor with its last update, sorted by name
    pub fn cursors(&self) -> Result<Vec<(String, i64, DateTime<Utc>)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT name, value, updated_at FROM cursors ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut cursors = Vec::new();
        for row in rows {
            let (name, value, updated_at) = row?;
            cursors.push((name, value, parse_ts(&updated_at)?));
        }
        Ok(cursors)
    }

    /// Row count of the table backing `collection`
    pub fn count(&self, collection: Collection) -> Result<u64> {
        let (table, _) = table_for(collection);
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl StateStore for SqliteStore {
    fn max_known_id(&self, collection: Collection) -> Result<Option<i64>> {
        let (table, column) = table_for(collection);
        let conn = self.lock_conn()?;
        let max = conn.query_row(&format!("SELECT MAX({column}) FROM {table}"), [], |row| row.get(0))?;
        Ok(max)
    }

    fn min_known_id(&self, collection: Collection) -> Result<Option<i64>> {
        let (table, column) = table_for(collection);
        let conn = self.lock_conn()?;
        let min = conn.query_row(&format!("SELECT MIN({column}) FROM {table}"), [], |row| row.get(0))?;
        Ok(min)
    }

    fn last_update(&self, key: FreshnessKey) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = match key {
            FreshnessKey::Collection(collection) => {
                let (table, _) = table_for(collection);
                conn.query_row(&format!("SELECT MAX(updated_at) FROM {table}"), [], |row| row.get(0))?
            }
            // A player row without a steam id has never been fully fetched
            FreshnessKey::Entity(Collection::Players, id) => conn.query_row(
                "SELECT MAX(updated_at) FROM players WHERE account_id = ?1 AND steam_id IS NOT NULL",
                [id],
                |row| row.get(0),
            )?,
            FreshnessKey::Entity(collection, id) => {
                let (table, column) = table_for(collection);
                conn.query_row(
                    &format!("SELECT MAX(updated_at) FROM {table} WHERE {column} = ?1"),
                    [id],
                    |row| row.get(0),
                )?
            }
        };
        raw.as_deref().map(parse_ts).transpose()
    }

    fn known_ids(&self, collection: Collection) -> Result<Vec<i64>> {
        let (table, column) = table_for(collection);
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT DISTINCT {column} FROM {table} ORDER BY {column}"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn candidate_account_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT account_id FROM hero_rankings
             UNION SELECT account_id FROM notable_players
             UNION SELECT account_id FROM players
             ORDER BY 1",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn load_cursor(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row("SELECT value FROM cursors WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn persist_cursor(&self, name: &str, value: i64) -> Result<()> {
        self.persist_cursor_at(name, value, Utc::now())
    }

    fn clear_cursor(&self, name: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM cursors WHERE name = ?1", [name])?;
        Ok(())
    }

    fn defer(&self, collection: Collection, id: i64, reason: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO deferred (collection, id, reason, deferred_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET reason = excluded.reason, deferred_at = excluded.deferred_at",
            params![collection.name(), id, reason, format_ts(Utc::now())],
        )?;
        debug!(collection = %collection, id = id, reason = reason, "Deferred item");
        Ok(())
    }

    fn deferred_ids(&self, collection: Collection) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM deferred WHERE collection = ?1 ORDER BY id DESC")?;
        let ids = stmt
            .query_map([collection.name()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn clear_deferred(&self, collection: Collection, id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM deferred WHERE collection = ?1 AND id = ?2",
            params![collection.name(), id],
        )?;
        Ok(())
    }

    fn load_rate_limit_state(&self) -> Result<Option<RateLimitState>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT tokens, last_refill, window_start, requests_in_window, daily_requests, daily_window_start
                 FROM rate_limit_state WHERE endpoint = ?1",
                [GLOBAL_RATE_LIMIT_KEY],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((tokens, last_refill, window_start, requests_in_window, daily_requests, daily)) = row else {
            return Ok(None);
        };

        Ok(Some(RateLimitState {
            tokens,
            last_refill: parse_ts(&last_refill)?,
            window_start: parse_ts(&window_start)?,
            requests_in_window,
            daily_requests,
            daily_window_start: NaiveDate::parse_from_str(&daily, DATE_FMT)
                .map_err(|_| StorageError::InvalidTimestamp(daily.clone()))?,
        }))
    }

    fn persist_rate_limit_state(&self, state: &RateLimitState) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO rate_limit_state (endpoint, tokens, last_refill, window_start, requests_in_window, daily_requests, daily_window_start, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(endpoint) DO UPDATE SET
                tokens = excluded.tokens,
                last_refill = excluded.last_refill,
                window_start = excluded.window_start,
                requests_in_window = excluded.requests_in_window,
                daily_requests = excluded.daily_requests,
                daily_window_start = excluded.daily_window_start,
                updated_at = excluded.updated_at",
            params![
                GLOBAL_RATE_LIMIT_KEY,
                state.tokens,
                format_ts(state.last_refill),
                format_ts(state.window_start),
                state.requests_in_window,
                state.daily_requests,
                state.daily_window_start.format(DATE_FMT).to_string(),
                format_ts(Utc::now())
            ],
        )?;
        Ok(())
    }
}

impl EntitySink for SqliteStore {
    fn upsert(&self, entity: &Entity) -> Result<()> {
        self.upsert_at(entity, Utc::now())
    }

    fn upsert_all(&self, entities: &[Entity]) -> Result<()> {
        self.upsert_all_at(entities, Utc::now())
    }
}
