//! `status` and `check-config` commands

use clap::Args;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::{Cli, CliError, OutputFormat};
use crate::config::format_duration;
use crate::limiter::{RateLimitStatus, RateLimiter};
use crate::storage::SqliteStore;
use crate::Collection;

const COLLECTIONS: [Collection; 6] = [
    Collection::Heroes,
    Collection::HeroRankings,
    Collection::NotablePlayers,
    Collection::Teams,
    Collection::Players,
    Collection::Matches,
];

/// Show stored state
#[derive(Args, Debug)]
pub struct StatusCommand {}

/// Stored cursor
#[derive(Debug, Serialize)]
struct CursorView {
    name: String,
    value: i64,
    updated_at: String,
}

/// Everything `status` reports
#[derive(Debug, Serialize)]
struct StatusReport {
    database: String,
    rate_limit: RateLimitStatus,
    cursors: Vec<CursorView>,
    rows: Vec<(Collection, u64)>,
}

impl StatusCommand {
    /// Print limiter budget, cursors and row counts
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let config = cli.load_config()?;
        let store = Arc::new(SqliteStore::open(&config.pipeline.database)?);
        let limiter = RateLimiter::new(config.rate_limit.clone(), store.clone());

        let cursors = store
            .cursors()?
            .into_iter()
            .map(|(name, value, updated_at)| CursorView {
                name,
                value,
                updated_at: updated_at.to_rfc3339(),
            })
            .collect();
        let rows = COLLECTIONS
            .iter()
            .map(|c| Ok((*c, store.count(*c)?)))
            .collect::<Result<Vec<_>, CliError>>()?;

        let report = StatusReport {
            database: config.pipeline.database.display().to_string(),
            rate_limit: limiter.status(),
            cursors,
            rows,
        };

        match cli.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Human => print_status(&report),
        }
        Ok(())
    }
}

fn print_status(report: &StatusReport) {
    let limit = &report.rate_limit;
    println!("Database: {}", report.database);
    println!(
        "Rate limit: {}/{} tokens, {}/{} requests today ({} remaining, resets in {})",
        limit.tokens_available,
        limit.requests_per_minute,
        limit.daily_requests,
        limit.requests_per_day,
        limit.daily_remaining,
        format_duration(limit.until_daily_reset)
    );
    if report.cursors.is_empty() {
        println!("Cursors: none");
    } else {
        println!("Cursors:");
        for cursor in &report.cursors {
            println!("  {:<28} {:>14}  (updated {})", cursor.name, cursor.value, cursor.updated_at);
        }
    }
    println!("Rows:");
    for (collection, count) in &report.rows {
        println!("  {:<16} {:>10}", collection.name(), count);
    }
}

/// Validate configuration
#[derive(Args, Debug)]
pub struct CheckConfigCommand {}

impl CheckConfigCommand {
    /// Print the merged configuration and resolved expirations
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let config = cli.load_config()?;
        let expirations = config.expiration.resolve()?;

        match cli.output_format {
            OutputFormat::Json => {
                let resolved: serde_json::Map<String, serde_json::Value> = COLLECTIONS
                    .iter()
                    .map(|c| {
                        let name = c.name().to_string();
                        let value = json!(format_duration(expirations.for_name(c.name())));
                        (name, value)
                    })
                    .collect();
                let output = json!({ "config": config, "expirations": resolved });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Human => {
                println!("Configuration is valid");
                println!("  base url:     {}", config.api.base_url);
                println!("  database:     {}", config.pipeline.database.display());
                println!(
                    "  rate limit:   {}/min, {}/day",
                    config.rate_limit.requests_per_minute, config.rate_limit.requests_per_day
                );
                println!(
                    "  breaker:      {} of {} failures, {} min calls, {} open",
                    config.breaker.failure_threshold,
                    config.breaker.sliding_window_size,
                    config.breaker.minimum_calls,
                    format_duration(config.breaker.timeout())
                );
                println!(
                    "  chunks:       {} items, skip limit {}",
                    config.reader.chunk_size, config.pipeline.skip_limit
                );
                println!("  expirations:");
                for collection in COLLECTIONS {
                    println!(
                        "    {:<16} {}",
                        collection.name(),
                        format_duration(expirations.for_name(collection.name()))
                    );
                }
            }
        }
        Ok(())
    }
}
