//! Unit tests for configuration files and validation

use gg_ingest::config::{ConfigError, IngestConfig};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ingest.toml");
    fs::write(
        &path,
        r#"
[api]
base_url = "http://127.0.0.1:3000/api"
max_retries = 4
api_key = "secret"

[breaker]
failure_threshold = 2
sliding_window_size = 10
minimum_calls = 1

[rate_limit]
requests_per_minute = 30
requests_per_day = 500

[reader]
chunk_size = 25
team_pages = 3

[pipeline]
skip_limit = 5
database = "data/ingest.db"

[expiration]
heroes = "1w"
players = "30m"
"#,
    )
    .unwrap();

    let config = IngestConfig::load(Some(path.as_path())).unwrap();
    config.validate().unwrap();

    assert_eq!(config.api.max_retries, 4);
    assert_eq!(config.api.api_key.as_deref(), Some("secret"));
    assert_eq!(config.breaker.threshold_percent(), 2.0);
    assert_eq!(config.rate_limit.requests_per_day, 500);
    assert_eq!(config.reader.team_pages, 3);
    assert_eq!(config.pipeline.skip_limit, 5);

    let policy = config.expiration.resolve().unwrap();
    assert_eq!(policy.for_name("heroes"), Duration::from_secs(7 * 86_400));
    assert_eq!(policy.for_name("players"), Duration::from_secs(30 * 60));
    assert_eq!(policy.for_name("teams"), Duration::from_secs(180 * 86_400));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let err = IngestConfig::load(Some(dir.path().join("absent.toml").as_path())).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_invalid_values_fail_validation() {
    let mut config = IngestConfig::default();
    config.rate_limit.requests_per_minute = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Missing("rate_limit.requests_per_minute"))
    ));

    let mut config = IngestConfig::default();
    config.api.base_url = "ftp://example.com".into();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "api.base_url", .. })));

    let mut config = IngestConfig::default();
    config.expiration.players = "six hours".into();
    assert!(matches!(config.validate(), Err(ConfigError::InvalidDuration { .. })));
}

#[test]
fn test_unknown_toml_type_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[reader]\nchunk_size = \"ten\"\n").unwrap();
    assert!(matches!(IngestConfig::load(Some(path.as_path())), Err(ConfigError::Parse { .. })));
}
