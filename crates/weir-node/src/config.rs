//! Node configuration.
//!
//! The node reads a YAML document; every key is optional:
//!
//! ```yaml
//! listen_addr: 127.0.0.1:9418
//! log_level: debug
//! log_json: false
//! max_connections: 32
//! receive:
//!   allow_non_fast_forwards: false
//!   timeout_secs: 60
//! ```

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use weir_git::ReceiveConfig;

/// Default `git://` port.
pub const DEFAULT_PORT: u16 = 9418;

/// Configuration for a Weir node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the daemon listens on.
    pub listen_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Emit logs as JSON.
    pub log_json: bool,
    /// Sessions served at the same time; further connections are refused.
    pub max_connections: usize,
    /// Policy for every push.
    pub receive: ReceiveConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            log_level: "info".to_string(),
            log_json: false,
            max_connections: 64,
            receive: ReceiveConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(NodeError::Config(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        if self.max_connections == 0 {
            return Err(NodeError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.receive.ref_log_ident.trim().is_empty() {
            return Err(NodeError::Config(
                "receive.ref_log_ident must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
