// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.
//!
//! [`dispatch`] routes a claimed job to its handler by queue name. Handlers
//! that belong to a larger flow live with that flow (builds in
//! [`crate::build`], deploys in [`crate::deploy`], isolation in
//! [`crate::isolation`], dock loss in [`crate::dock`]); the small ones are here.

use serde::de::DeserializeOwned;
use slipway_core::graph::TriggeredAction;
use slipway_core::jobs::{
    BuildContainerDied, ContainerNetworkAttached, CreateImageBuilderContainer,
    CreateInstanceContainer, DockRemoved, InstanceContainerDied, InstanceDeployed, InstanceRebuild, JobRecord,
    KillIsolation, LABEL_INSTANCE_ID, queue,
};
use tracing::{debug, info};

use crate::build;
use crate::dedup::{BuildOutcome, BuildRequest, request_build};
use crate::deploy;
use crate::dock;
use crate::error::{Error, Result};
use crate::isolation;
use crate::state::OrchestratorState;

/// Queues the job worker consumes.
pub const CONSUMED_QUEUES: &[&str] = &[
    queue::BUILD_CONTAINER_DIED,
    queue::APPLICATION_CONTAINER_DIED,
    queue::INSTANCE_CONTAINER_DIED,
    queue::CONTAINER_NETWORK_ATTACHED,
    queue::INSTANCE_DEPLOYED,
    queue::INSTANCE_REBUILD,
    queue::CREATE_IMAGE_BUILDER_CONTAINER,
    queue::CREATE_INSTANCE_CONTAINER,
    queue::KILL_ISOLATION,
    queue::DOCK_REMOVED,
];

/// Trigger message of manual rebuilds.
pub const REBUILD_MESSAGE: &str = "manual";

/// Route a job to its handler.
pub async fn dispatch(state: &OrchestratorState, job: &JobRecord) -> Result<()> {
    debug!(job_id = job.id, queue = %job.queue, attempts = job.attempts, "Dispatching job");
    match job.queue.as_str() {
        queue::BUILD_CONTAINER_DIED => {
            let payload: BuildContainerDied = decode(job)?;
            build::complete_build(state, &payload).await.map(|_| ())
        }
        queue::APPLICATION_CONTAINER_DIED | queue::INSTANCE_CONTAINER_DIED => {
            let payload: InstanceContainerDied = decode(job)?;
            isolation::handle_instance_died(state, &payload).await
        }
        queue::CONTAINER_NETWORK_ATTACHED => {
            let payload: ContainerNetworkAttached = decode(job)?;
            handle_network_attached(state, &payload).await
        }
        queue::INSTANCE_DEPLOYED => {
            let payload: InstanceDeployed = decode(job)?;
            handle_instance_deployed(state, &payload).await
        }
        queue::INSTANCE_REBUILD => {
            let payload: InstanceRebuild = decode(job)?;
            rebuild_instance(state, &payload).await.map(|_| ())
        }
        queue::CREATE_IMAGE_BUILDER_CONTAINER => {
            let payload: CreateImageBuilderContainer = decode(job)?;
            build::create_image_builder(state, &payload).await
        }
        queue::CREATE_INSTANCE_CONTAINER => {
            let payload: CreateInstanceContainer = decode(job)?;
            deploy::create_instance_container(state, &payload).await
        }
        queue::KILL_ISOLATION => {
            let payload: KillIsolation = decode(job)?;
            isolation::kill_isolation(state, &payload).await
        }
        queue::DOCK_REMOVED => {
            let payload: DockRemoved = decode(job)?;
            dock::handle_dock_removed(state, &payload).await.map(|_| ())
        }
        other => Err(Error::Validation(format!("no handler for queue {}", other))),
    }
}

fn decode<T: DeserializeOwned>(job: &JobRecord) -> Result<T> {
    job.decode()
        .map_err(|e| Error::Validation(format!("malformed {} payload: {}", job.queue, e)))
}

/// Record the network details of a freshly attached container.
pub async fn handle_network_attached(
    state: &OrchestratorState,
    job: &ContainerNetworkAttached,
) -> Result<()> {
    let instance_id = job
        .inspect_data
        .label(LABEL_INSTANCE_ID)
        .ok_or_else(|| Error::Validation(format!("missing label {}", LABEL_INSTANCE_ID)))?;

    let host_ip = job
        .host
        .as_deref()
        .and_then(|host| reqwest::Url::parse(host).ok())
        .and_then(|url| url.host_str().map(str::to_string));
    let ports = job
        .inspect_data
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref());

    match state
        .store
        .set_instance_network(
            &instance_id,
            &job.id,
            &job.container_ip,
            host_ip.as_deref(),
            ports,
        )
        .await?
    {
        Some(instance) => {
            info!(
                instance_id = %instance.id,
                container_id = %job.id,
                network_ip = %job.container_ip,
                "Container network attached"
            );
            state.notifier.instance_updated(&instance, "update").await;
        }
        None => debug!(
            instance_id = %instance_id,
            container_id = %job.id,
            "Network attached to a container the instance no longer uses"
        ),
    }
    Ok(())
}

/// Forward a deploy to listeners.
pub async fn handle_instance_deployed(
    state: &OrchestratorState,
    job: &InstanceDeployed,
) -> Result<()> {
    state
        .notifier
        .instance_deployed(&job.instance_id, &job.cv_id)
        .await;
    Ok(())
}

/// Rebuild an instance's current sources without cache.
///
/// The instance is pointed at the new build right away; the container is
/// recreated when the build completes.
pub async fn rebuild_instance(
    state: &OrchestratorState,
    job: &InstanceRebuild,
) -> Result<BuildOutcome> {
    let instance = state
        .store
        .get_instance(&job.instance_id)
        .await?
        .ok_or_else(|| Error::not_found("Instance", &job.instance_id))?;
    let cv = &instance.context_version;

    let outcome = request_build(
        state,
        BuildRequest {
            context_id: cv.context_id.clone(),
            app_code_versions: cv.app_code_versions.clone(),
            infra_code_version: cv.infra_code_version.clone(),
            advanced: cv.advanced,
            created_by: instance.created_by,
            docker_host: None,
            no_cache: true,
            triggered_action: TriggeredAction {
                manual: true,
                app_code_version: None,
                rebuild: true,
            },
            message: Some(REBUILD_MESSAGE.to_string()),
        },
    )
    .await?;

    let updated = state
        .store
        .set_instance_deployment(&instance.id, &outcome.build.id, &outcome.context_version)
        .await?
        .ok_or_else(|| Error::not_found("Instance", &instance.id))?;
    info!(
        instance_id = %updated.id,
        context_version_id = %outcome.context_version.id,
        "Instance rebuild started"
    );
    state.notifier.instance_updated(&updated, "patch").await;
    Ok(outcome)
}
