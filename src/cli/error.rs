//! CLI error types and conversions

use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::pipeline::{JobKind, JobStatus};
use crate::storage::StorageError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Gateway construction error
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Output could not be rendered
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Metrics exporter could not start
    #[error("metrics error: {0}")]
    Metrics(String),

    /// A job finished without completing
    #[error("job '{job}' finished with status {status}")]
    JobNotCompleted {
        /// Job
        job: JobKind,
        /// Final status
        status: JobStatus,
    },
}
