// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipway Orchestrator - Build and Deploy Worker
//!
//! Runs the job worker and the stale job reaper against the configured
//! resource graph store:
//! - build dedup and image-builder containers
//! - deploy fan-out and instance containers
//! - isolation kills and redeploys

use std::sync::Arc;

use slipway_core::{PostgresStore, SqliteStore, Store};
use slipway_orchestrator::collaborators::{DockerHttpRuntime, HttpDockFinder, TracingNotifier};
use slipway_orchestrator::config::Config;
use slipway_orchestrator::runtime::OrchestratorRuntime;
use tracing::{info, warn};

/// Connections opened to PostgreSQL.
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slipway_orchestrator=info,slipway_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        placement_url = %config.placement_url,
        builder_image = %config.builder_image,
        registry = %config.registry,
        "Starting slipway-orchestrator"
    );

    let store = open_store(&config.database_url).await?;

    let runtime = OrchestratorRuntime::builder()
        .config(&config)
        .store(store)
        .docks(Arc::new(HttpDockFinder::new(config.placement_url.clone())?))
        .runtime(Arc::new(DockerHttpRuntime::new()))
        .notifier(Arc::new(TracingNotifier::default()))
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    runtime.shutdown().await?;
    Ok(())
}

async fn open_store(database_url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        info!(path, "Using SQLite store");
        Ok(Arc::new(SqliteStore::from_path(path).await?))
    } else {
        info!("Using PostgreSQL store");
        Ok(Arc::new(
            PostgresStore::connect(database_url, POSTGRES_MAX_CONNECTIONS).await?,
        ))
    }
}
