//! # Weir Node
//!
//! A `git://` daemon that serves pushes into in-memory repositories.
//!
//! ```text
//!   client ──► accept loop ──► connection thread
//!                                 │ request line
//!                                 │ RepoStore::get_or_create
//!                                 ▼
//!                             ReceivePack (weir-git)
//! ```
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weir_node::{NodeConfig, Server};
//! use weir_storage::RepoStore;
//!
//! let handle = Server::new(NodeConfig::default(), Arc::new(RepoStore::new()))
//!     .start()
//!     .unwrap();
//! println!("listening on {}", handle.local_addr());
//! handle.wait();
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod server;

pub use config::{NodeConfig, DEFAULT_PORT};
pub use error::{NodeError, Result};
pub use server::{DaemonRequest, Server, ServerHandle, RECEIVE_PACK};
