//! # hearthd
//!
//! Runs a hearth node until interrupted.
//!
//! ```bash
//! hearthd --config hearth.toml
//! hearthd --config hearth.toml --p2p-port 9100 --log-level debug
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use peer_node::{Node, NodeConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Hearth peer node daemon.
#[derive(Parser, Debug)]
#[command(name = "hearthd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "hearth.toml")]
    config: PathBuf,

    /// Override the storage directory
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Override the P2P listen port
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log a status summary this often, in seconds (0 disables)
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        NodeConfig::from_file(&cli.config)?
    } else {
        NodeConfig::default()
    };
    if let Some(path) = cli.storage_path {
        config.storage_path = path;
    }
    if let Some(port) = cli.p2p_port {
        config.p2p_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "starting hearthd");

    let node = Node::start(config).await.context("failed to start node")?;

    if cli.status_interval > 0 {
        let period = Duration::from_secs(cli.status_interval);
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let status = node.status().await;
                    info!(
                        nat = status.nat,
                        sessions = status.sessions.len(),
                        known_peers = status.known_peers,
                        pending = status.queues.iter().map(|q| q.depth).sum::<usize>(),
                        "status"
                    );
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    break;
                }
            }
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }

    info!("shutting down");
    node.shutdown().await;
    Ok(())
}
