// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators of the orchestrator.
//!
//! The orchestrator treats these as black boxes:
//!
//! | Trait | Default implementation | Purpose |
//! |-------|------------------------|---------|
//! | [`DockFinder`] | [`HttpDockFinder`] | Placement: pick a Docker host for a build or container |
//! | [`ContainerRuntime`] | [`DockerHttpRuntime`] | Create and kill containers on a dock |
//! | [`Notifier`] | [`TracingNotifier`] | One-way UI/update events |
//!
//! [`mock`] provides recording implementations of all three for tests.

mod docker;
pub mod mock;
mod notify;
mod placement;

pub use docker::DockerHttpRuntime;
pub use mock::{MockContainerRuntime, MockDockFinder, NotifyEvent, RecordingNotifier};
pub use notify::TracingNotifier;
pub use placement::HttpDockFinder;

use std::collections::HashMap;

use async_trait::async_trait;
use slipway_core::graph::{ContextVersion, Instance, Owner};
use thiserror::Error;

/// Errors from collaborator calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollaboratorError {
    /// The service could not be reached or failed internally.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The service understood the request and refused it.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// Classify an unsuccessful HTTP response.
pub(crate) fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> CollaboratorError {
    let message = format!("{} returned HTTP {}: {}", service, status.as_u16(), body);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CollaboratorError::Unavailable(message)
    } else {
        CollaboratorError::Rejected(message)
    }
}

/// Classify a transport-level HTTP failure.
pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> CollaboratorError {
    if err.is_decode() {
        CollaboratorError::Rejected(format!("{} sent an unreadable response: {}", service, err))
    } else {
        CollaboratorError::Unavailable(format!("{} request failed: {}", service, err))
    }
}

/// Everything needed to start an image-builder container.
#[derive(Debug, Clone)]
pub struct ImageBuilderSpec {
    /// Version being built.
    pub context_version: ContextVersion,
    /// Dock to build on.
    pub docker_host: String,
    /// Image-builder image.
    pub builder_image: String,
    /// Tag of the image to produce.
    pub image_tag: String,
    /// Container labels, echoed back on `build.container.died`.
    pub labels: HashMap<String, String>,
    /// Skip the layer cache.
    pub no_cache: bool,
}

/// Everything needed to start an instance container.
#[derive(Debug, Clone)]
pub struct InstanceContainerSpec {
    /// Target instance.
    pub instance_id: String,
    /// Context version whose image runs.
    pub context_version_id: String,
    /// Dock to run on.
    pub docker_host: String,
    /// Image to run.
    pub image: String,
    /// Environment, `KEY=value`.
    pub env: Vec<String>,
    /// Container labels, echoed back on lifecycle events.
    pub labels: HashMap<String, String>,
}

/// Placement service.
#[async_trait]
pub trait DockFinder: Send + Sync {
    /// Pick a dock to build `cv` on.
    async fn find_dock_for_build(&self, owner: &Owner, cv: &ContextVersion) -> Result<String>;

    /// Pick a dock to run a container of `cv` on.
    async fn find_dock_for_container(&self, owner: &Owner, cv: &ContextVersion)
    -> Result<String>;

    /// Whether a dock is currently accepting work.
    async fn is_dock_available(&self, docker_host: &str) -> Result<bool>;
}

/// Container runtime on the docks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start an image-builder container. Returns its id.
    async fn create_image_builder(&self, spec: &ImageBuilderSpec) -> Result<String>;

    /// Create and start an instance container. Returns its id.
    async fn create_instance_container(&self, spec: &InstanceContainerSpec) -> Result<String>;

    /// Kill a container. A container that is already gone is not an error.
    async fn kill_container(&self, docker_host: &str, container_id: &str) -> Result<()>;
}

/// One-way notifications for listeners such as a UI.
///
/// Delivery is not guaranteed; implementations must not fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// An instance changed (`action` is e.g. `patch`, `deploy`, `update`).
    async fn instance_updated(&self, instance: &Instance, action: &str);

    /// A build reached a terminal state.
    async fn build_completed(&self, cv: &ContextVersion);

    /// An instance finished deploying.
    async fn instance_deployed(&self, instance_id: &str, context_version_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = status_error("placement", reqwest::StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(matches!(err, CollaboratorError::Unavailable(_)));

        let err = status_error("placement", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(err, CollaboratorError::Unavailable(_)));

        let err = status_error("docker", reqwest::StatusCode::NOT_FOUND, "no such image");
        match err {
            CollaboratorError::Rejected(msg) => assert!(msg.contains("404")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
