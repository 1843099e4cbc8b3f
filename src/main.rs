//! Main entry point for the gg-ingest CLI

use clap::Parser;
use gg_ingest::cli::{Cli, Commands};
use gg_ingest::shutdown::{self, ShutdownCoordinator};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gg_ingest=info"));

    if json_format {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    let shutdown = ShutdownCoordinator::shared();
    shutdown::install_global(shutdown.clone());
    shutdown::listen_for_ctrl_c(shutdown.clone());

    let result = match &cli.command {
        Commands::Run(args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Schedule(args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Status(cmd) => cmd.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
        Commands::CheckConfig(cmd) => cmd.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
