//! Error types for the CLI

use memory_manager::GcError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI-specific errors
#[derive(Debug, Error)]
pub enum CliError {
    /// The configuration file could not be read
    #[error("cannot read config file {}: {source}", path.display())]
    ConfigFile {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Error reported by the heap or its collector
    #[error(transparent)]
    Gc(#[from] GcError),

    /// Inconsistent command-line options
    #[error("invalid options: {0}")]
    Usage(String),

    /// The reachable graph was found damaged
    #[error("heap check failed: {0}")]
    Check(String),

    /// Report serialization failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
