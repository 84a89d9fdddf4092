//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object was not found.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference was not found.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// An object could not be decoded.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A reference is malformed or cannot be resolved.
    #[error("invalid ref: {0}")]
    InvalidRef(String),

    /// The repository already exists.
    #[error("repository already exists: {0}")]
    RepoExists(String),

    /// The repository does not exist.
    #[error("repository not found: {0}")]
    RepoNotFound(String),
}
