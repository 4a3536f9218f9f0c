//! hearth-registry binary entry point.
//!
//! Usage:
//! ```bash
//! hearth-registry --config registry.toml
//! hearth-registry --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use peer_registry::{cleanup, http, Config, Registry, SqliteStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Discovery registry for hearth peers.
#[derive(Parser, Debug)]
#[command(name = "hearth-registry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "registry.toml")]
    config: PathBuf,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    config.validate()?;

    let storage = SqliteStorage::new(&config.storage.database)
        .await
        .with_context(|| format!("failed to open {}", config.storage.database.display()))?;
    let bind_address = config.server.bind_address.clone();
    let cleanup_config = config.cleanup.clone();
    let registry = Arc::new(Registry::new(config, storage));

    let sweeper = cleanup::spawn_cleanup_task(registry.clone(), cleanup_config);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %listener.local_addr()?,
        "hearth-registry listening"
    );

    tokio::select! {
        result = http::serve(listener, registry) => result.context("http server failed")?,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
        }
    }
    sweeper.abort();
    Ok(())
}
