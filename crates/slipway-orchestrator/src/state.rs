// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared state passed to every orchestration operation.

use std::sync::Arc;
use std::time::Duration;

use slipway_core::Store;
use slipway_core::graph::ContextVersion;

use crate::collaborators::{ContainerRuntime, DockFinder, Notifier};
use crate::config::Config;
use crate::publisher::JobPublisher;
use crate::retry::RetryPolicy;

/// Tunables of the orchestration operations.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Image used for image-builder containers.
    pub builder_image: String,
    /// Registry prefix for built image tags.
    pub registry: String,
    /// In-task retries for container creation and placement lookups.
    pub container_retry: RetryPolicy,
    /// A pending build that never got a container stops deduping after this long.
    pub pending_build_ttl: Duration,
}

impl Settings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            builder_image: config.builder_image.clone(),
            registry: config.registry.clone(),
            container_retry: RetryPolicy::new(
                config.create_container_retry_attempts,
                config.docker_retry_interval,
            ),
            pending_build_ttl: config.pending_build_ttl,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            builder_image: "slipway/image-builder:latest".to_string(),
            registry: "registry.slipway.local".to_string(),
            container_retry: RetryPolicy::default(),
            pending_build_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Store, publisher and collaborators shared by all handlers.
///
/// Holds no mutable state of its own: all coordination between concurrent
/// handlers goes through conditional writes on the store.
#[derive(Clone)]
pub struct OrchestratorState {
    /// Resource graph store.
    pub store: Arc<dyn Store>,
    /// Outbound job publisher.
    pub publisher: JobPublisher,
    /// Placement service.
    pub docks: Arc<dyn DockFinder>,
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// UI/update notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Tunables.
    pub settings: Settings,
}

impl OrchestratorState {
    /// Create the state. Jobs it publishes are delivered at most `job_max_attempts` times.
    pub fn new(
        store: Arc<dyn Store>,
        docks: Arc<dyn DockFinder>,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Arc<dyn Notifier>,
        settings: Settings,
        job_max_attempts: i32,
    ) -> Self {
        Self {
            publisher: JobPublisher::new(store.clone(), job_max_attempts),
            store,
            docks,
            runtime,
            notifier,
            settings,
        }
    }

    /// Tag of the image a context version builds into.
    pub fn image_tag(&self, cv: &ContextVersion) -> String {
        format!(
            "{}/{}/{}:{}",
            self.settings.registry, cv.owner.github_id, cv.context_id, cv.id
        )
    }
}
