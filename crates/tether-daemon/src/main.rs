//! tether-daemon: headless sync client.
//!
//! Connects to a sync server over WebSocket, keeps a durable operation
//! queue and cached collections on disk, and syncs registered data types
//! periodically and on reconnect.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_core::{
    DataTypeConfig, EngineConfig, EventBus, FileStore, HttpRemote, LocalStore, RemoteApi,
    SyncEngine,
};
use tether_daemon::connection::{ConnectionConfig, ConnectionManager};
use tether_daemon::frame::CLOSE_NORMAL;

#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(about = "Offline-tolerant sync daemon")]
struct Args {
    /// WebSocket URL of the sync server
    #[arg(short, long)]
    url: String,

    /// Path to the data-type configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for the durable store (queue, caches, timestamps)
    #[arg(short, long, default_value = ".tether")]
    data_dir: PathBuf,

    /// Seconds between periodic full syncs
    #[arg(long, default_value_t = 60)]
    interval: u64,

    /// Auth token appended to the connect URL
    #[arg(long)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// On-disk daemon configuration: the set of synchronizable data types.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    types: Vec<TypeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeEntry {
    name: String,
    endpoint: String,
    cache_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let config: DaemonConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", args.config.display()))?;

    let bus = Arc::new(EventBus::new());
    let store: Arc<dyn LocalStore> = Arc::new(FileStore::new(&args.data_dir));
    let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemote::new(Duration::from_secs(30))?);

    let engine = SyncEngine::new(
        EngineConfig {
            sync_interval: Duration::from_secs(args.interval),
            ..EngineConfig::default()
        },
        Arc::clone(&bus),
        store,
        remote,
    )?;
    for entry in &config.types {
        engine.register_data_type(
            &entry.name,
            DataTypeConfig::new(&entry.endpoint, &entry.cache_key),
        )?;
        info!(data_type = %entry.name, endpoint = %entry.endpoint, "registered data type");
    }

    let _connectivity = engine.attach_connectivity(&bus);
    engine.start_periodic();

    let manager = ConnectionManager::new(ConnectionConfig::new(&args.url), Arc::clone(&bus));
    manager.set_token(args.token.clone());
    manager.connect();
    info!(url = %args.url, data_dir = %args.data_dir.display(), "daemon started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop_periodic();
    manager.disconnect(CLOSE_NORMAL, "shutdown");

    Ok(())
}
