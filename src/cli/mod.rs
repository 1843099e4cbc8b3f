//! Command-line interface
//!
//! Global flags override values from the TOML config file; every command
//! validates the merged configuration before touching the store or the
//! network.

pub mod error;
pub mod run;
pub mod status;

pub use error::CliError;
pub use run::{RunArgs, ScheduleArgs, ScheduleMode};
pub use status::{CheckConfigCommand, StatusCommand};

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::IngestConfig;
use crate::gateway::ApiGateway;
use crate::storage::SqliteStore;

/// Pro match statistics ingestion CLI
#[derive(Parser, Debug)]
#[command(name = "gg-ingest")]
#[command(about = "Ingest pro match statistics from a rate-limited stats API", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "GG_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides `pipeline.database`)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Upstream base URL (overrides `api.base_url`)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Upstream API key (overrides `api.api_key`)
    #[arg(long, global = true, env = "OPENDOTA_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Items per chunk (overrides `reader.chunk_size`)
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Address for the Prometheus exporter; disabled when absent
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job now
    Run(RunArgs),

    /// Run steps on their cadences, or one job on an interval, until Ctrl+C
    Schedule(ScheduleArgs),

    /// Show rate limit budget, cursors and stored row counts
    Status(StatusCommand),

    /// Validate the configuration and print the resolved values
    CheckConfig(CheckConfigCommand),
}

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

impl Cli {
    /// Load the config file and apply flag overrides, then validate
    ///
    /// # Errors
    /// Returns [`CliError::Config`] if the file cannot be read or the merged
    /// configuration is invalid.
    pub fn load_config(&self) -> Result<IngestConfig, CliError> {
        let mut config = IngestConfig::load(self.config.as_deref())?;

        if let Some(database) = &self.database {
            config.pipeline.database = database.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.api.base_url = base_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api.api_key = Some(api_key.clone());
        }
        if let Some(chunk_size) = self.chunk_size {
            config.reader.chunk_size = chunk_size;
        }

        config.validate()?;
        Ok(config)
    }

    /// Start the Prometheus exporter if an address was given
    pub fn start_metrics(&self) -> Result<(), CliError> {
        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr).map_err(|e| CliError::Metrics(e.to_string()))?;
            info!(addr = %addr, "Metrics exporter listening");
        }
        Ok(())
    }
}

/// Open the store and build the gateway for a validated configuration
pub(crate) fn connect(config: &IngestConfig) -> Result<(Arc<SqliteStore>, Arc<ApiGateway>), CliError> {
    let store = Arc::new(SqliteStore::open(&config.pipeline.database)?);
    let gateway = Arc::new(ApiGateway::from_config(config, store.clone())?);
    info!(
        database = %config.pipeline.database.display(),
        base_url = gateway.base_url(),
        "Connected store and gateway"
    );
    Ok((store, gateway))
}
