// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable orchestrator runtime.
//!
//! Wires the store and collaborators into an [`OrchestratorState`] and runs the
//! background tasks that drive it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use slipway_core::SqliteStore;
//! use slipway_orchestrator::collaborators::{DockerHttpRuntime, HttpDockFinder};
//! use slipway_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/slipway.db").await?);
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .store(store)
//!         .docks(Arc::new(HttpDockFinder::new("http://127.0.0.1:4242")?))
//!         .runtime(Arc::new(DockerHttpRuntime::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // Publish work through runtime.state() or let docks report events.
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use slipway_core::Store;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::collaborators::{ContainerRuntime, DockFinder, Notifier, TracingNotifier};
use crate::config::Config;
use crate::reaper::{JobReaper, JobReaperConfig};
use crate::state::{OrchestratorState, Settings};
use crate::worker::{JobWorker, JobWorkerConfig};

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    docks: Option<Arc<dyn DockFinder>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: Settings,
    worker_config: JobWorkerConfig,
    reaper_config: JobReaperConfig,
    job_max_attempts: i32,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            docks: None,
            runtime: None,
            notifier: None,
            settings: Settings::default(),
            worker_config: JobWorkerConfig::default(),
            reaper_config: JobReaperConfig::default(),
            job_max_attempts: 5,
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take settings, worker, reaper and job budget from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = Settings::from_config(config);
        self.worker_config = JobWorkerConfig::from_config(config);
        self.reaper_config = JobReaperConfig::from_config(config);
        self.job_max_attempts = config.job_max_attempts;
        self
    }

    /// Set the resource graph store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the placement service (required).
    pub fn docks(mut self, docks: Arc<dyn DockFinder>) -> Self {
        self.docks = Some(docks);
        self
    }

    /// Set the container runtime (required).
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the notifier.
    ///
    /// Default: [`TracingNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the orchestration tunables.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the job worker configuration.
    pub fn worker_config(mut self, config: JobWorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Set the stale job reaper configuration.
    pub fn reaper_config(mut self, config: JobReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// Set how many deliveries a published job gets.
    ///
    /// Default: 5
    pub fn job_max_attempts(mut self, attempts: i32) -> Self {
        self.job_max_attempts = attempts;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let docks = self
            .docks
            .ok_or_else(|| anyhow::anyhow!("docks is required"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("runtime is required"))?;
        if self.job_max_attempts < 1 {
            anyhow::bail!("job_max_attempts must be at least 1");
        }
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier::default()));

        let state = OrchestratorState::new(
            store,
            docks,
            runtime,
            notifier,
            self.settings,
            self.job_max_attempts,
        );

        Ok(OrchestratorRuntimeConfig {
            state,
            worker_config: self.worker_config,
            reaper_config: self.reaper_config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    state: OrchestratorState,
    worker_config: JobWorkerConfig,
    reaper_config: JobReaperConfig,
}

impl OrchestratorRuntimeConfig {
    /// The state the runtime will run with.
    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Start the runtime, spawning the job worker and reaper tasks.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        match self.state.store.health_check_db().await {
            Ok(true) => {}
            Ok(false) => warn!("Store health check reported unhealthy"),
            Err(e) => anyhow::bail!("store is unreachable: {}", e),
        }

        let worker = JobWorker::new(self.state.clone(), self.worker_config);
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        let reaper = JobReaper::new(self.state.store.clone(), self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        info!("OrchestratorRuntime started");

        Ok(OrchestratorRuntime {
            worker_handle,
            reaper_handle,
            worker_shutdown,
            reaper_shutdown,
            state: self.state,
        })
    }
}

/// A running orchestrator: the job worker and the stale job reaper.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    worker_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
    state: OrchestratorState,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Gracefully shut down the runtime.
    ///
    /// A job being handled when shutdown is signalled is finished first.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.worker_shutdown.notify_one();
        self.reaper_shutdown.notify_one();

        if let Err(e) = self.worker_handle.await {
            error!("Job worker task panicked: {}", e);
        }
        if let Err(e) = self.reaper_handle.await {
            error!("Job reaper task panicked: {}", e);
        }

        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockContainerRuntime, MockDockFinder};

    #[test]
    fn test_build_requires_store() {
        let result = OrchestratorRuntime::builder()
            .docks(Arc::new(MockDockFinder::default()))
            .runtime(Arc::new(MockContainerRuntime::new()))
            .build();
        match result {
            Err(e) => assert!(e.to_string().contains("store is required")),
            Ok(_) => panic!("expected missing store error"),
        }
    }
}
