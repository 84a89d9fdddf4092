//! Node error types.

use thiserror::Error;

/// Errors raised by the daemon outside of a receive session.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed configuration file.
    #[error("configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed daemon request line.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client asked for a service this node does not offer.
    #[error("service not enabled: {0}")]
    ServiceNotEnabled(String),

    /// The receive session failed.
    #[error(transparent)]
    Git(#[from] weir_git::GitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
