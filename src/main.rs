//! driftwatch - endpoint polling and change-notification engine
//!
//! Polls tracked endpoints on a fixed interval, detects activity-label
//! transitions, persists per-label history, and fans out notifications.

mod config;
mod db;
mod notify;
mod probe;
mod scheduler;

use config::Config;
use db::Store;
use notify::{LogNotifier, LogSink};
use probe::UdpProber;
use scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("driftwatch=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = Config::load();
    tracing::info!(
        "Starting driftwatch: poll every {}s, probe timeout {}s",
        cfg.poll_interval_secs,
        cfg.probe_timeout_secs
    );
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Create scheduler with the default prober and logging sinks; swap in
    // real Notifier/Sink implementations to integrate a delivery platform.
    let scheduler = Scheduler::new(
        store,
        Arc::new(UdpProber),
        Arc::new(LogNotifier),
        Arc::new(LogSink),
        cfg,
    );

    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
