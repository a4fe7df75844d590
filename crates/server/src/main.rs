//! Depot transfer daemon.

use anyhow::{Context, Result};
use clap::Parser;
use depot_server::{AppState, load_config, spawn_sweeper};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Depot - resumable chunked transfers over pluggable storage
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEPOT_CONFIG", default_value = "config/depot.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Depot v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(Path::new(&args.config))?;

    depot_transfer::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let state = AppState::initialize(config).await?;

    let sweeper = spawn_sweeper(
        state.metadata.clone(),
        state.config.server.sweep_interval(),
    );
    tracing::info!(
        interval_secs = state.config.server.sweep_interval_secs,
        "Expiry sweeper spawned"
    );

    // Without a connected client, events only reach the log.
    let mut events = state.events.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(notification) => tracing::debug!(
                    user_id = %notification.user_id,
                    task_id = %notification.task_id,
                    kind = notification.event.kind(),
                    "Transfer event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("Depot ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    sweeper.abort();
    event_log.abort();
    state.shutdown().await;

    match depot_transfer::metrics::render() {
        Ok(text) => tracing::info!(metrics = %text, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}
