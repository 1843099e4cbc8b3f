//! Ingestion configuration
//!
//! Configuration is read from an optional TOML file in which every field has a
//! default, then overridden by CLI flags. [`IngestConfig::validate`] must pass
//! before any component is wired; a failure there is fatal.
//!
//! ```toml
//! [api]
//! base_url = "https://api.opendota.com/api"
//!
//! [rate_limit]
//! requests_per_minute = 50
//! requests_per_day = 1800
//!
//! [expiration]
//! heroes = "4mo"
//! players = "6h"
//! ```

pub mod duration;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub use duration::{format_duration, parse_duration};

/// Default upstream base URL
pub const DEFAULT_BASE_URL: &str = "https://api.opendota.com/api";

/// Expiration applied when neither the name nor a configured default matches
pub const FALLBACK_EXPIRATION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// A duration string could not be parsed
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration {
        /// Raw input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A required value is missing, zero or blank
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),

    /// A value is present but out of range
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Upstream API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Retries for network errors and 5xx responses within one guarded call
    pub max_retries: u32,
    /// First retry backoff in milliseconds, doubled per retry and capped at 30s
    pub retry_backoff_ms: u64,
    /// Optional API key, sent as the `api_key` query parameter
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_ms: 1_000,
            api_key: None,
        }
    }
}

/// Circuit breaker settings, shared by every named breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Percentage (<= 100) or absolute failure count within the window (> 100)
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed, in milliseconds
    pub timeout_ms: u64,
    /// Calls recorded before the failure rate is considered
    pub minimum_calls: u32,
    /// Capacity of the sliding outcome window
    pub sliding_window_size: usize,
}

impl BreakerConfig {
    /// Open-state timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Failure threshold expressed as a percentage of the window
    pub fn threshold_percent(&self) -> f64 {
        if self.failure_threshold <= 100 {
            f64::from(self.failure_threshold)
        } else {
            f64::from(self.failure_threshold) / self.sliding_window_size as f64 * 100.0
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 20,
            success_threshold: 3,
            timeout_ms: 30_000,
            minimum_calls: 10,
            sliding_window_size: 100,
        }
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Token bucket capacity
    pub requests_per_minute: u32,
    /// Daily request cap (UTC calendar day)
    pub requests_per_day: u32,
    /// Time for the bucket to refill from empty, in milliseconds
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            requests_per_day: 1_800,
            refill_interval_ms: 60_000,
        }
    }
}

/// Raw expiration strings keyed by collection name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Hero collection
    pub heroes: String,
    /// Team collection
    pub teams: String,
    /// Notable player collection
    pub notableplayers: String,
    /// Hero rankings
    pub herorankings: String,
    /// Individual players
    pub players: String,
    /// Applied to names without their own entry
    #[serde(alias = "defaults")]
    pub default: String,
    /// Additional named expirations
    #[serde(flatten)]
    pub other: BTreeMap<String, String>,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            heroes: "4mo".to_string(),
            teams: "6mo".to_string(),
            notableplayers: "3mo".to_string(),
            herorankings: "1mo".to_string(),
            players: "6h".to_string(),
            default: "3mo".to_string(),
            other: BTreeMap::new(),
        }
    }
}

impl ExpirationConfig {
    /// Parse every entry into an [`ExpirationPolicy`]
    pub fn resolve(&self) -> Result<ExpirationPolicy, ConfigError> {
        let mut by_name = HashMap::new();
        let named = [
            ("heroes", &self.heroes),
            ("teams", &self.teams),
            ("notableplayers", &self.notableplayers),
            ("herorankings", &self.herorankings),
            ("players", &self.players),
        ];
        for (name, raw) in named {
            by_name.insert(name.to_string(), parse_duration(raw)?);
        }
        for (name, raw) in &self.other {
            by_name.insert(name.to_lowercase(), parse_duration(raw)?);
        }

        let default = if self.default.trim().is_empty() {
            FALLBACK_EXPIRATION
        } else {
            parse_duration(&self.default)?
        };

        Ok(ExpirationPolicy { by_name, default })
    }
}

/// Parsed expirations, looked up case-insensitively
#[derive(Debug, Clone, PartialEq)]
pub struct ExpirationPolicy {
    by_name: HashMap<String, Duration>,
    default: Duration,
}

impl ExpirationPolicy {
    /// Expiration for a collection name, falling back to the default
    pub fn for_name(&self, name: &str) -> Duration {
        let duration = self
            .by_name
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(self.default);
        debug!(name = name, expiration = %format_duration(duration), "Resolved expiration");
        duration
    }
}

/// Reader settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaderConfig {
    /// Items per chunk
    pub chunk_size: usize,
    /// Safety cap on pages fetched by a cursor reader in one run
    pub max_pages_per_run: u32,
    /// Numbered pages fetched for the team collection
    pub team_pages: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            max_pages_per_run: 20,
            team_pages: 20,
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Skipped items tolerated per step before the step fails
    pub skip_limit: u64,
    /// SQLite database path
    pub database: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_limit: 50,
            database: PathBuf::from("gg_ingest.db"),
        }
    }
}

/// When one step runs under `schedule`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CadenceConfig {
    /// Interval between runs, as a duration string
    pub every: String,
    /// UTC time of day the slots are aligned to (`HH:MM`), midnight if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl CadenceConfig {
    fn new(every: &str, at: Option<&str>) -> Self {
        Self {
            every: every.to_string(),
            at: at.map(str::to_string),
        }
    }
}

/// Per-step scheduling
///
/// A `[schedule.cadence]` table in the config file replaces the built-in
/// plan as a whole; steps it leaves out are not scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Scheduled runs are skipped while fewer daily requests remain
    pub min_daily_budget: u32,
    /// Cadence per step name
    pub cadence: BTreeMap<String, CadenceConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let cadence = [
            ("new-matches", CadenceConfig::new("15m", None)),
            ("historical-matches", CadenceConfig::new("1d", Some("03:00"))),
            ("heroes", CadenceConfig::new("1d", Some("02:00"))),
            ("notable-players", CadenceConfig::new("6h", None)),
            ("players", CadenceConfig::new("6h", None)),
            ("teams", CadenceConfig::new("4h", None)),
            ("hero-rankings", CadenceConfig::new("2h", None)),
        ]
        .into_iter()
        .map(|(step, cadence)| (step.to_string(), cadence))
        .collect();

        Self {
            min_daily_budget: 50,
            cadence,
        }
    }
}

/// Complete ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Upstream API
    pub api: ApiConfig,
    /// Circuit breaker
    pub breaker: BreakerConfig,
    /// Rate limiter
    pub rate_limit: RateLimitConfig,
    /// Staleness expirations
    pub expiration: ExpirationConfig,
    /// Readers
    pub reader: ReaderConfig,
    /// Pipeline
    pub pipeline: PipelineConfig,
    /// Scheduler
    pub schedule: ScheduleConfig,
}

impl IngestConfig {
    /// Load configuration from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            debug!("No config file given, using defaults");
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Check that every required value is present and in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("api.base_url"));
        }
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "api.base_url",
                reason: format!("'{}' is not an http(s) URL", self.api.base_url),
            });
        }
        if self.api.connect_timeout_ms == 0 {
            return Err(ConfigError::Missing("api.connect_timeout_ms"));
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::Missing("api.request_timeout_ms"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Missing("breaker.failure_threshold"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::Missing("breaker.success_threshold"));
        }
        if self.breaker.sliding_window_size == 0 {
            return Err(ConfigError::Missing("breaker.sliding_window_size"));
        }
        if self.breaker.timeout_ms == 0 {
            return Err(ConfigError::Missing("breaker.timeout_ms"));
        }

        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Missing("rate_limit.requests_per_minute"));
        }
        if self.rate_limit.requests_per_day == 0 {
            return Err(ConfigError::Missing("rate_limit.requests_per_day"));
        }
        if self.rate_limit.refill_interval_ms == 0 {
            return Err(ConfigError::Missing("rate_limit.refill_interval_ms"));
        }

        if self.reader.chunk_size == 0 {
            return Err(ConfigError::Missing("reader.chunk_size"));
        }
        if self.reader.max_pages_per_run == 0 {
            return Err(ConfigError::Missing("reader.max_pages_per_run"));
        }
        if self.pipeline.database.as_os_str().is_empty() {
            return Err(ConfigError::Missing("pipeline.database"));
        }

        self.expiration.resolve()?;
        crate::pipeline::SchedulePlan::from_config(&self.schedule)?;
        Ok(())
    }
}
