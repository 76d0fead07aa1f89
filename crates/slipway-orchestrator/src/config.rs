// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for slipway-orchestrator.

use std::str::FromStr;
use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `sqlite:` or `postgres://` URL of the resource graph store
    pub database_url: String,
    /// Placement ("find a dock") service base URL
    pub placement_url: String,
    /// Image used for image-builder containers
    pub builder_image: String,
    /// Registry prefix for built image tags
    pub registry: String,
    /// How often the job worker polls for due jobs
    pub worker_poll_interval: Duration,
    /// Jobs claimed per poll
    pub worker_batch_size: i64,
    /// Deliveries allowed per job before it is dead-lettered
    pub job_max_attempts: i32,
    /// Fixed delay before a failed job is redelivered
    pub job_retry_delay: Duration,
    /// In-task attempts for container creation and placement lookups
    pub create_container_retry_attempts: u32,
    /// Delay between in-task attempts
    pub docker_retry_interval: Duration,
    /// A pending build that never got a container stops deduping after this long
    pub pending_build_ttl: Duration,
    /// Running jobs older than this are requeued
    pub stale_job_after: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("SLIPWAY_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("SLIPWAY_DATABASE_URL"))?;
        if !database_url.starts_with("sqlite:")
            && !database_url.starts_with("postgres://")
            && !database_url.starts_with("postgresql://")
        {
            return Err(ConfigError::Invalid {
                var: "SLIPWAY_DATABASE_URL",
                value: database_url,
            });
        }

        let placement_url = lookup("SLIPWAY_PLACEMENT_URL")
            .unwrap_or_else(|| "http://127.0.0.1:4242".to_string());
        let builder_image = lookup("SLIPWAY_BUILDER_IMAGE")
            .unwrap_or_else(|| "slipway/image-builder:latest".to_string());
        let registry =
            lookup("SLIPWAY_REGISTRY").unwrap_or_else(|| "registry.slipway.local".to_string());

        Ok(Self {
            database_url,
            placement_url,
            builder_image,
            registry,
            worker_poll_interval: Duration::from_millis(parse(
                &lookup,
                "SLIPWAY_WORKER_POLL_MS",
                500u64,
            )?),
            worker_batch_size: parse(&lookup, "SLIPWAY_WORKER_BATCH_SIZE", 10i64)?,
            job_max_attempts: parse(&lookup, "SLIPWAY_JOB_MAX_ATTEMPTS", 5i32)?,
            job_retry_delay: Duration::from_millis(parse(
                &lookup,
                "SLIPWAY_JOB_RETRY_DELAY_MS",
                1000u64,
            )?),
            create_container_retry_attempts: parse(
                &lookup,
                "SLIPWAY_CREATE_CONTAINER_RETRY_ATTEMPTS",
                5u32,
            )?,
            docker_retry_interval: Duration::from_millis(parse(
                &lookup,
                "SLIPWAY_DOCKER_RETRY_INTERVAL_MS",
                500u64,
            )?),
            pending_build_ttl: Duration::from_secs(parse(
                &lookup,
                "SLIPWAY_PENDING_BUILD_TTL_SECS",
                1800u64,
            )?),
            stale_job_after: Duration::from_secs(parse(&lookup, "SLIPWAY_STALE_JOB_SECS", 300u64)?),
        })
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable has a value that cannot be used.
    #[error("Invalid value for {var}: '{value}'")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
