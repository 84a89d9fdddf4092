//! Session-fatal error types.
//!
//! Anything represented here aborts the whole receive session. Rejections
//! that concern a single ref are recorded on its
//! [`ReceiveCommand`](crate::ReceiveCommand) instead.

use thiserror::Error;
use weir_storage::ObjectId;

/// Errors that abort a receive-pack session.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pack file format.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// The pack exceeded the configured size limit.
    #[error("pack exceeds the limit of {limit} bytes")]
    PackTooLarge {
        /// Configured limit in bytes.
        limit: u64,
    },

    /// A single object exceeded the configured size limit.
    #[error("object {size} bytes exceeds the limit of {limit} bytes")]
    ObjectTooLarge {
        /// Inflated object size.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// A received object failed validation.
    #[error("invalid object {id}: {reason}")]
    InvalidObject {
        /// Offending object.
        id: ObjectId,
        /// What was wrong with it.
        reason: String,
    },

    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed push certificate.
    #[error("invalid push certificate: {0}")]
    Certificate(String),

    /// An object reachable from the pushed tips is not available.
    #[error("missing {kind} {id}")]
    MissingObject {
        /// The missing object.
        id: ObjectId,
        /// Object kind expected at that position in the graph.
        kind: &'static str,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] weir_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
