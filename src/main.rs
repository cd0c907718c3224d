//! HeartBeats - host monitoring daemon
//!
//! Probes every registered host on a fixed interval and serves hosts and
//! their metric history over a local Unix socket.

mod config;
mod db;
mod ipc;
mod lifecycle;
mod probe;
mod scheduler;
mod telemetry;

use config::ServerConfig;
use db::Store;
use ipc::SocketListener;
use probe::ProbeSettings;
use scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let cfg = ServerConfig::from_env()?;

    // Initialize logging
    telemetry::init(&cfg)?;
    tracing::info!("Starting HeartBeats on {}...", cfg.socket_path.display());
    tracing::info!("Using database at {}", cfg.db_path.display());

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Shutdown triggers
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    lifecycle::spawn_signal_handler(shutdown_tx.clone());
    if let Some(pid) = cfg.parent_pid {
        let period = Duration::from_secs(1);
        tokio::spawn(lifecycle::watch_parent(pid, period, shutdown_tx.clone()));
    }

    let listener = SocketListener::bind(&cfg.socket_path).await?;
    tracing::info!("Listening on {}", listener.path().display());

    // Start probing
    let scheduler = Scheduler::new(store.clone(), cfg.ping_interval, ProbeSettings::default());
    scheduler.start()?;

    // Serve until shutdown
    let router = Arc::new(ipc::routes(store));
    listener.serve(router, cfg.connection_options(), shutdown_rx).await?;

    tracing::info!("HeartBeats stopped");
    Ok(())
}
