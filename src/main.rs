//! Duplex Router (edge process)
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                     EDGE ROUTER                       │
//!   Client Request       │  ┌─────────┐   ┌────────────┐   ┌──────────────────┐  │
//!   ─────────────────────┼─▶│  http   │──▶│ dispatcher │──▶│ registry         │  │
//!                        │  │ server  │   │            │   │ acquire / create │  │
//!                        │  └─────────┘   └─────┬──────┘   └──────────────────┘  │
//!                        │                      │ admit / bootstrap              │
//!                        │                      ▼                                │
//!   Client Response      │               ┌──────────────┐     POST /invoke       │
//!   ◀────────────────────┼───────────────│ session actor│────────────────────────┼──▶ Worker
//!                        │   streamed    │ (per worker) │◀═══ /websocket ════════┼═══ process
//!                        │   body        └──────────────┘   incoming / outgoing-*│
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use duplex_router::config::{load_config, RouterConfig};
use duplex_router::lifecycle::{spawn_signal_handler, Shutdown};
use duplex_router::observability::{logging, metrics};
use duplex_router::registry::{JsonFileStore, MemoryStore, RecordStore, Registry};
use duplex_router::session::HttpInvoker;
use duplex_router::HttpServer;

#[derive(Parser)]
#[command(name = "duplex-router")]
#[command(about = "Edge router multiplexing HTTP requests over worker websockets", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };

    let level = &config.observability.log_level;
    logging::init_tracing(&format!("duplex_router={level},tower_http={level}"));
    tracing::info!("duplex-router v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections_per_worker = config.pool.max_connections_per_worker,
        policy = ?config.pool.policy,
        invoke_url = %config.bootstrap.invoke_url,
        "Configuration loaded"
    );

    let store: Arc<dyn RecordStore> = match &config.storage.path {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let registry = Arc::new(Registry::load(store, &config.pool)?);
    tracing::info!(workers = registry.snapshot().len(), "Registry loaded");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    let invoker = Arc::new(HttpInvoker::new(&config.bootstrap));
    let server = HttpServer::new(config, registry, invoker);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
