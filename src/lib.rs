//! Unified Market Data Orchestrator
//!
//! Keeps OHLC bar coverage fresh for a set of (symbol, timeframe) pairs:
//! detects gaps against a persisted coverage range, slices them into job
//! runs, fetches bars from routed providers under rate limits, and exposes
//! an on-demand ensure-coverage path plus a realtime job feed.

pub mod api;
pub mod db;
pub mod error;
pub mod feed;
pub mod market;
pub mod providers;
pub mod scheduler;
pub mod services;
pub mod state;

use api::ApiServer;
use scheduler::TickScheduler;
use services::Orchestrator;
use state::{AppConfig, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize and run the orchestrator until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_orchestrator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting market orchestrator...");

    let config = AppConfig::from_env()?;
    let state = Arc::new(AppState::new(&config)?);
    let settings = state.settings()?;
    tracing::info!("Instance {} with settings {:?}", config.instance_id, settings);

    let orchestrator = Arc::new(Orchestrator::new(state.clone()));

    let mut scheduler = TickScheduler::new(orchestrator.clone());
    let scheduler_task = scheduler.start();

    let mut server = ApiServer::new(orchestrator.clone());
    if settings.api_enabled {
        server.start(&settings.api_host, settings.api_port).await?;
    } else {
        tracing::info!("HTTP API is disabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    server.stop();
    scheduler.stop();
    if let Err(e) = scheduler_task.await {
        tracing::error!("Tick scheduler task failed: {}", e);
    }

    // In-flight runs finish; anything cut short is recovered by the watchdog
    let outcomes = orchestrator.wait_for_workers().await;
    tracing::info!("Stopped after draining {} workers", outcomes.len());

    Ok(())
}
