//! Object and reference storage for Weir.
//!
//! This crate provides the content-addressed object store, the reference
//! store with batched (optionally atomic) edits, and the repository that
//! ties them together. The receive-pack engine in `weir-git` treats these
//! types as its storage collaborators.

mod error;
mod object;
mod refs;
mod store;

pub use error::StorageError;
pub use object::{CommitInfo, GitObject, ObjectId, ObjectType, TagInfo, TreeEntry, HEX_LEN};
pub use refs::{RefEdit, RefEditStatus, RefStore, Reference, ReflogEntry};
pub use store::{ObjectStore, PackLock, RepoStore, Repository};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
