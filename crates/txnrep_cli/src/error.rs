//! CLI error type.

use thiserror::Error;
use txnrep_core::CoreError;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The replicator failed.
    #[error("replicator error: {0}")]
    Replicator(#[from] CoreError),

    /// Output could not be rendered.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Invalid command-line input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
