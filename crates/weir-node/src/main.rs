//! Weir Node - `git://` push daemon.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use weir_node::observability::{init_logging, LogFormat};
use weir_node::{NodeConfig, Server};
use weir_storage::RepoStore;

/// Weir Node - accepts git pushes over git://
#[derive(Parser, Debug)]
#[command(name = "weir-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.log_json |= args.log_json;
    config.validate().context("invalid configuration")?;

    init_logging(&config.log_level, LogFormat::from_json_flag(config.log_json));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Weir node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        max_connections = config.max_connections,
        atomic = config.receive.allow_atomic,
        signed_push = config.receive.certificate_nonce_seed.is_some(),
        "Node configuration"
    );

    let handle = Server::new(config, Arc::new(RepoStore::new()))
        .start()
        .context("starting daemon")?;
    handle.wait();
    Ok(())
}
