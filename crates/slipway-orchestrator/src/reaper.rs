// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stale job reaper.
//!
//! A job claimed by a worker that crashed stays `running` forever. The reaper
//! periodically puts such jobs back to `pending`; the delivery counter is
//! left as is, so a job that keeps killing its worker is eventually
//! dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slipway_core::Store;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct JobReaperConfig {
    /// How often to look for stale jobs
    pub poll_interval: Duration,
    /// A running job older than this is considered abandoned
    pub stale_after: Duration,
}

impl Default for JobReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl JobReaperConfig {
    /// Reaper settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_after: config.stale_job_after,
            ..Self::default()
        }
    }
}

/// Stale job reaper that runs as a background task.
pub struct JobReaper {
    store: Arc<dyn Store>,
    config: JobReaperConfig,
    shutdown: Arc<Notify>,
}

impl JobReaper {
    /// Create a new reaper.
    pub fn new(store: Arc<dyn Store>, config: JobReaperConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Job reaper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Job reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.requeue_stale().await {
                        error!(error = %e, "Failed to requeue stale jobs");
                    }
                }
            }
        }
    }

    /// Requeue abandoned jobs once. Returns how many were requeued.
    pub async fn requeue_stale(&self) -> Result<u64> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let requeued = self
            .store
            .requeue_stale_jobs(Utc::now() - stale_after)
            .await?;

        if requeued > 0 {
            warn!(count = requeued, "Requeued stale jobs");
        } else {
            debug!("No stale jobs");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::SqliteStore;
    use slipway_core::jobs::queue;
    use slipway_core::persistence::JobQueue;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_requeues_running_jobs_only_when_stale() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        slipway_core::migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));

        let id = store
            .enqueue_job(queue::KILL_ISOLATION, &serde_json::json!({}), 3)
            .await
            .unwrap();
        let claimed = store
            .claim_due_jobs(&[queue::KILL_ISOLATION], 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let patient = JobReaper::new(
            store.clone(),
            JobReaperConfig {
                stale_after: Duration::from_secs(3600),
                ..JobReaperConfig::default()
            },
        );
        assert_eq!(patient.requeue_stale().await.unwrap(), 0);

        let eager = JobReaper::new(
            store.clone(),
            JobReaperConfig {
                stale_after: Duration::ZERO,
                ..JobReaperConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(eager.requeue_stale().await.unwrap(), 1);

        let pending = store
            .list_jobs(queue::KILL_ISOLATION, Some("pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].attempts, 1);
    }
}
