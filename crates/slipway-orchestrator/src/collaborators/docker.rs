// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine API client, one connection per dock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, StartContainerOptions,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    CollaboratorError, ContainerRuntime, ImageBuilderSpec, InstanceContainerSpec, Result,
    status_error,
};

const SERVICE: &str = "docker";

/// Request timeout for every dock, in seconds.
const TIMEOUT_SECS: u64 = 30;

/// [`ContainerRuntime`] speaking the Docker Engine API on each dock.
///
/// `docker_host` values are base URLs such as `http://10.0.0.1:4242`.
#[derive(Debug, Clone, Default)]
pub struct DockerHttpRuntime {
    clients: Arc<Mutex<HashMap<String, Docker>>>,
}

impl DockerHttpRuntime {
    /// Create a runtime client. Dock connections are opened lazily.
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, docker_host: &str) -> Result<Docker> {
        let host = docker_host.trim_end_matches('/');
        let mut clients = self.clients.lock().await;
        if let Some(docker) = clients.get(host) {
            return Ok(docker.clone());
        }
        let docker = Docker::connect_with_http(host, TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| {
                CollaboratorError::Rejected(format!("invalid dock address {}: {}", host, e))
            })?;
        clients.insert(host.to_string(), docker.clone());
        Ok(docker)
    }

    async fn create_and_start(
        &self,
        docker_host: &str,
        body: ContainerCreateBody,
    ) -> Result<String> {
        let docker = self.client(docker_host).await?;
        let created = docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(docker_error)?;

        match docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            // Already started
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(docker_error(e)),
        }

        debug!(docker_host, container_id = %created.id, "Container started");
        Ok(created.id)
    }
}

/// Classify a Docker Engine failure.
fn docker_error(err: DockerError) -> CollaboratorError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => status_error(
            SERVICE,
            StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            &message,
        ),
        other => CollaboratorError::Unavailable(format!("{} request failed: {}", SERVICE, other)),
    }
}

/// Environment handed to the image builder.
fn builder_env(spec: &ImageBuilderSpec) -> Vec<String> {
    let cv = &spec.context_version;
    let mut repos = Vec::new();
    let mut branches = Vec::new();
    let mut commits = Vec::new();
    for acv in &cv.app_code_versions {
        repos.push(acv.repo.as_str());
        branches.push(acv.branch.as_str());
        commits.push(acv.commit.as_str());
    }

    let mut env = vec![
        format!("SLIPWAY_REPOS={}", repos.join(";")),
        format!("SLIPWAY_BRANCHES={}", branches.join(";")),
        format!("SLIPWAY_COMMITS={}", commits.join(";")),
        format!("SLIPWAY_DOCKER_TAG={}", spec.image_tag),
        format!("SLIPWAY_INFRA_CODE_VERSION={}", cv.infra_code_version.id),
        format!("SLIPWAY_BUILD_ID={}", cv.build.id),
    ];
    if spec.no_cache {
        env.push("SLIPWAY_NO_CACHE=true".to_string());
    }
    env
}

fn builder_body(spec: &ImageBuilderSpec) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(spec.builder_image.clone()),
        env: Some(builder_env(spec)),
        labels: Some(spec.labels.clone()),
        host_config: Some(HostConfig {
            binds: Some(vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn instance_body(spec: &InstanceContainerSpec) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        host_config: Some(HostConfig {
            publish_all_ports: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerHttpRuntime {
    async fn create_image_builder(&self, spec: &ImageBuilderSpec) -> Result<String> {
        let id = self
            .create_and_start(&spec.docker_host, builder_body(spec))
            .await?;
        info!(
            context_version_id = %spec.context_version.id,
            container_id = %id,
            "Image builder container created"
        );
        Ok(id)
    }

    async fn create_instance_container(&self, spec: &InstanceContainerSpec) -> Result<String> {
        let id = self
            .create_and_start(&spec.docker_host, instance_body(spec))
            .await?;
        info!(
            instance_id = %spec.instance_id,
            container_id = %id,
            "Instance container created"
        );
        Ok(id)
    }

    async fn kill_container(&self, docker_host: &str, container_id: &str) -> Result<()> {
        let docker = self.client(docker_host).await?;
        match docker
            .kill_container(container_id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // Gone, or not running any more.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(container_id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(docker_error(e)),
        }
    }
}
