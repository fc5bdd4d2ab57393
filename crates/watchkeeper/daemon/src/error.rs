//! Error types for watchkeeperd

use thiserror::Error;
use watchkeeper_kernel::AgentError;
use watchkeeper_storage::StorageError;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audit memory error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Agent wiring or lifecycle error
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// HTTP client construction error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Output serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        DaemonError::Config(err.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
