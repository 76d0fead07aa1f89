// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job worker.
//!
//! Polls the job table for due jobs on the consumed queues and hands each one
//! to [`dispatch`]. A job is acknowledged only after its handler returns:
//!
//! | Handler result | Job |
//! |----------------|-----|
//! | `Ok` | done |
//! | retryable error, attempts left | pending again after `retry_delay` |
//! | anything else | failed (dead-lettered) |

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slipway_core::jobs::JobRecord;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::handlers::{CONSUMED_QUEUES, dispatch};
use crate::state::OrchestratorState;

/// Job worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How often to poll for due jobs
    pub poll_interval: Duration,
    /// Maximum jobs to claim per poll
    pub batch_size: i64,
    /// Delay before a failed job is redelivered
    pub retry_delay: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl JobWorkerConfig {
    /// Worker settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.worker_poll_interval,
            batch_size: config.worker_batch_size,
            retry_delay: config.job_retry_delay,
        }
    }
}

/// How a single delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded.
    Done,
    /// Handler failed and the job will be redelivered.
    Retried,
    /// The job was dead-lettered.
    DeadLettered,
}

/// Job worker that runs as a background task.
pub struct JobWorker {
    state: OrchestratorState,
    config: JobWorkerConfig,
    shutdown: Arc<Notify>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(state: OrchestratorState, config: JobWorkerConfig) -> Self {
        Self {
            state,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            queues = CONSUMED_QUEUES.len(),
            "Job worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Job worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = %e, "Failed to process job batch");
                    }
                }
            }
        }
    }

    /// Claim and handle one batch of due jobs. Returns how many were claimed.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self
            .state
            .store
            .claim_due_jobs(CONSUMED_QUEUES, self.config.batch_size, Utc::now())
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(count = jobs.len(), "Claimed jobs");

        for job in &jobs {
            if let Err(e) = self.process_job(job).await {
                // The job stays running and the reaper requeues it.
                error!(job_id = job.id, queue = %job.queue, error = %e, "Failed to acknowledge job");
            }
        }
        Ok(jobs.len())
    }

    /// Handle one claimed job and acknowledge it.
    pub async fn process_job(&self, job: &JobRecord) -> Result<JobOutcome> {
        let store = &self.state.store;

        // Requeued by the reaper after its last allowed delivery.
        if job.attempts > job.max_attempts {
            warn!(
                job_id = job.id,
                queue = %job.queue,
                attempts = job.attempts,
                "Job exceeded its delivery budget"
            );
            store.fail_job(job.id, "delivery budget exceeded").await?;
            return Ok(JobOutcome::DeadLettered);
        }

        match dispatch(&self.state, job).await {
            Ok(()) => {
                store.complete_job(job.id).await?;
                debug!(job_id = job.id, queue = %job.queue, "Job done");
                Ok(JobOutcome::Done)
            }
            Err(e) if e.is_retryable() && !job.attempts_exhausted() => {
                let delay = chrono::Duration::from_std(self.config.retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                warn!(
                    job_id = job.id,
                    queue = %job.queue,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %e,
                    "Job failed, will retry"
                );
                store
                    .retry_job(job.id, &e.to_string(), Utc::now() + delay)
                    .await?;
                Ok(JobOutcome::Retried)
            }
            Err(e) => {
                error!(
                    job_id = job.id,
                    queue = %job.queue,
                    attempts = job.attempts,
                    payload = %job.payload,
                    error_kind = e.kind(),
                    error = %e,
                    "Job dead-lettered"
                );
                store.fail_job(job.id, &e.to_string()).await?;
                Ok(JobOutcome::DeadLettered)
            }
        }
    }
}
