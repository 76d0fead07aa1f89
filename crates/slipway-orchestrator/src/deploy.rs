// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy fan-out.
//!
//! Deploying a build to an instance is always the same pipeline:
//!
//! 1. point the instance at the build and its context version,
//! 2. drop isolated masters whose group is killed and redeployed instead,
//! 3. pick a dock and publish `createInstanceContainer` and `instanceDeployed`,
//! 4. notify listeners.
//!
//! Step 1 always precedes step 3 for a given instance. Instances are processed
//! concurrently and independently: one instance failing is logged and does
//! not stop the others.

use std::collections::HashMap;

use futures::future::join_all;
use slipway_core::graph::{ContainerInfo, ContainerState, ContextVersion, Instance};
use slipway_core::jobs::{
    CreateInstanceContainer, InstanceDeployed, LABEL_CONTEXT_VERSION_ID, LABEL_INSTANCE_ID,
    LABEL_OWNER_USERNAME, LABEL_SESSION_USER_GITHUB_ID,
};
use tracing::{debug, error, info, warn};

use crate::collaborators::InstanceContainerSpec;
use crate::error::{Error, Result};
use crate::isolation::filter_out_and_kill_isolated_instances;
use crate::state::OrchestratorState;

/// Error recorded on an instance whose container could not be created.
pub const CREATE_CONTAINER_FAILED: &str = "failed to create container";

/// Who is deploying, and where.
#[derive(Debug, Clone, Default)]
pub struct DeployContext {
    /// Dock to use instead of asking placement.
    pub force_dock: Option<String>,
    /// GitHub id of the acting user.
    pub session_user_github_id: i64,
    /// Owner login, carried on container labels.
    pub owner_username: String,
}

/// A request to deploy a completed build.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Build to deploy.
    pub build_id: String,
    /// Deploy only to this instance. Locked instances are allowed here.
    pub instance_id: Option<String>,
    /// Dock to use instead of asking placement.
    pub force_dock: Option<String>,
    /// GitHub id of the acting user.
    pub session_user_github_id: i64,
    /// Owner login.
    pub owner_username: String,
}

/// Result of [`fan_out_build`].
#[derive(Debug, Clone, PartialEq)]
pub enum FanOutOutcome {
    /// Container requests were published for these instances.
    Deployed(Vec<Instance>),
    /// No instance qualified. Not an error.
    NoOp,
}

/// Deploy a completed build to the instances using it, or to one named instance.
pub async fn fan_out_build(
    state: &OrchestratorState,
    request: &DeployRequest,
) -> Result<FanOutOutcome> {
    let build = state
        .store
        .get_build(&request.build_id)
        .await?
        .ok_or_else(|| Error::not_found("Build", &request.build_id))?;
    if !build.completed || build.failed {
        return Err(Error::IncorrectState(format!(
            "build {} is not successfully completed",
            build.id
        )));
    }

    let mut versions = Vec::with_capacity(build.context_version_ids.len());
    for id in &build.context_version_ids {
        let cv = state
            .store
            .get_context_version(id)
            .await?
            .ok_or_else(|| Error::not_found("ContextVersion", id))?;
        versions.push(cv);
    }
    let Some(primary) = versions.first().cloned() else {
        return Err(Error::IncorrectState(format!(
            "build {} has no context versions",
            build.id
        )));
    };

    let candidates = match &request.instance_id {
        Some(instance_id) => vec![
            state
                .store
                .get_instance(instance_id)
                .await?
                .ok_or_else(|| Error::not_found("Instance", instance_id))?,
        ],
        None => state
            .store
            .find_instances_by_build(&build.id)
            .await?
            .into_iter()
            .filter(|instance| {
                if instance.locked {
                    debug!(instance_id = %instance.id, "Skipping locked instance");
                }
                !instance.locked
            })
            .collect(),
    };

    if candidates.is_empty() {
        info!(build_id = %build.id, "No instances to deploy to");
        return Ok(FanOutOutcome::NoOp);
    }

    let targets = candidates
        .into_iter()
        .map(|instance| {
            let cv = versions
                .iter()
                .find(|cv| cv.context_id == instance.context_version.context_id)
                .unwrap_or(&primary)
                .clone();
            (instance, cv)
        })
        .collect();

    let context = DeployContext {
        force_dock: request.force_dock.clone(),
        session_user_github_id: request.session_user_github_id,
        owner_username: request.owner_username.clone(),
    };
    let deployed = deploy_all(state, &build.id, targets, &context).await?;
    Ok(FanOutOutcome::Deployed(deployed))
}

/// Run the deploy pipeline for every target. Returns the instances a container was requested for.
///
/// Failing to update or enqueue one instance is logged and skipped. Failing
/// to check isolation state is returned: a missed kill would leave the group
/// half redeployed.
pub async fn deploy_all(
    state: &OrchestratorState,
    build_id: &str,
    targets: Vec<(Instance, ContextVersion)>,
    context: &DeployContext,
) -> Result<Vec<Instance>> {
    let remaining = point_at_build(state, build_id, targets).await?;

    let enqueues = remaining
        .into_iter()
        .map(|instance| async move { enqueue_container(state, instance, context).await });

    let mut deployed = Vec::new();
    for result in join_all(enqueues).await {
        match result {
            Ok(instance) => deployed.push(instance),
            // The instance already points at the new build; surfaced for operators.
            Err((instance_id, e)) => error!(
                instance_id = %instance_id,
                build_id,
                error = %e,
                "Instance updated but container request failed"
            ),
        }
    }
    Ok(deployed)
}

/// Steps 1 and 2 of the pipeline: point every target at the build, then drop
/// isolated masters whose group is killed instead. Returns the instances left.
pub(crate) async fn point_at_build(
    state: &OrchestratorState,
    build_id: &str,
    targets: Vec<(Instance, ContextVersion)>,
) -> Result<Vec<Instance>> {
    let updates = targets.iter().map(|(instance, cv)| async move {
        let result = state
            .store
            .set_instance_deployment(&instance.id, build_id, cv)
            .await;
        (instance, result)
    });

    let mut updated = Vec::new();
    for (instance, result) in join_all(updates).await {
        match result {
            Ok(Some(instance)) => updated.push(instance),
            Ok(None) => warn!(instance_id = %instance.id, "Instance disappeared before deploy"),
            Err(e) => error!(instance_id = %instance.id, error = %e, "Failed to update instance for deploy"),
        }
    }

    filter_out_and_kill_isolated_instances(state, updated).await
}

async fn enqueue_container(
    state: &OrchestratorState,
    instance: Instance,
    context: &DeployContext,
) -> std::result::Result<Instance, (String, Error)> {
    let result: Result<()> = async {
        let docker_host = resolve_container_dock(state, &instance, context.force_dock.as_deref())
            .await?;
        let job = container_job(
            &instance,
            &docker_host,
            context.session_user_github_id,
            &context.owner_username,
        );
        state.publisher.create_instance_container(&job).await?;
        state
            .publisher
            .instance_deployed(&InstanceDeployed {
                instance_id: instance.id.clone(),
                cv_id: instance.context_version.id.clone(),
            })
            .await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            state.notifier.instance_updated(&instance, "deploy").await;
            info!(
                instance_id = %instance.id,
                context_version_id = %instance.context_version.id,
                "Instance deploy requested"
            );
            Ok(instance)
        }
        Err(e) => Err((instance.id, e)),
    }
}

/// Dock for a new container of `instance`: the forced one, or placement's pick.
pub(crate) async fn resolve_container_dock(
    state: &OrchestratorState,
    instance: &Instance,
    force_dock: Option<&str>,
) -> Result<String> {
    if let Some(dock) = force_dock {
        return Ok(dock.to_string());
    }
    let docks = &state.docks;
    let (owner, cv) = (&instance.owner, &instance.context_version);
    state
        .settings
        .container_retry
        .run("find dock for container", move || async move {
            Ok(docks.find_dock_for_container(owner, cv).await?)
        })
        .await
}

/// The `createInstanceContainer` job for an instance's current context version.
pub(crate) fn container_job(
    instance: &Instance,
    docker_host: &str,
    session_user_github_id: i64,
    owner_username: &str,
) -> CreateInstanceContainer {
    let mut labels = HashMap::from([
        (LABEL_INSTANCE_ID.to_string(), instance.id.clone()),
        ("instanceName".to_string(), instance.name.clone()),
        ("instanceShortHash".to_string(), instance.short_hash.clone()),
        (
            LABEL_CONTEXT_VERSION_ID.to_string(),
            instance.context_version.id.clone(),
        ),
        (LABEL_OWNER_USERNAME.to_string(), owner_username.to_string()),
        (
            LABEL_SESSION_USER_GITHUB_ID.to_string(),
            session_user_github_id.to_string(),
        ),
    ]);
    if let Some(isolation_id) = &instance.isolated {
        labels.insert("isolationId".to_string(), isolation_id.clone());
    }

    CreateInstanceContainer {
        context_version_id: instance.context_version.id.clone(),
        instance_id: instance.id.clone(),
        docker_host: docker_host.to_string(),
        instance_envs: instance.env.clone(),
        labels,
        session_user_id: session_user_github_id,
    }
}

/// Consume `createInstanceContainer`: start the container and record it.
///
/// The job is stale (Conflict) if the instance has moved to another context
/// version since it was published. Once in-task retries are spent, the
/// failure is recorded on the instance instead of failing the job.
pub async fn create_instance_container(
    state: &OrchestratorState,
    job: &CreateInstanceContainer,
) -> Result<()> {
    let instance = state
        .store
        .get_instance(&job.instance_id)
        .await?
        .ok_or_else(|| Error::not_found("Instance", &job.instance_id))?;
    if instance.context_version.id != job.context_version_id {
        return Err(Error::Conflict(format!(
            "instance {} now uses context version {}, not {}",
            instance.id, instance.context_version.id, job.context_version_id
        )));
    }

    let cv = &instance.context_version;
    let spec = InstanceContainerSpec {
        instance_id: instance.id.clone(),
        context_version_id: cv.id.clone(),
        docker_host: job.docker_host.clone(),
        image: cv
            .build
            .docker_tag
            .clone()
            .unwrap_or_else(|| state.image_tag(cv)),
        env: job.instance_envs.clone(),
        labels: job.labels.clone(),
    };

    let runtime = &state.runtime;
    let spec = &spec;
    let created = state
        .settings
        .container_retry
        .run("create instance container", move || async move {
            Ok(runtime.create_instance_container(spec).await?)
        })
        .await;

    let container = match created {
        Ok(container_id) => ContainerInfo {
            docker_host: job.docker_host.clone(),
            container_id: Some(container_id),
            context_version_id: cv.id.clone(),
            state: ContainerState::Starting,
            exit_code: None,
            error: None,
            ports: None,
        },
        Err(e @ (Error::TransientInfrastructure(_) | Error::Rejected(_))) => {
            error!(instance_id = %instance.id, error = %e, "Giving up on instance container");
            ContainerInfo {
                docker_host: job.docker_host.clone(),
                container_id: None,
                context_version_id: cv.id.clone(),
                state: ContainerState::Dead,
                exit_code: None,
                error: Some(CREATE_CONTAINER_FAILED.to_string()),
                ports: None,
            }
        }
        Err(e) => return Err(e),
    };

    if !state
        .store
        .set_instance_container(&instance.id, &cv.id, &container)
        .await?
    {
        warn!(
            instance_id = %instance.id,
            context_version_id = %cv.id,
            "Instance moved on while its container was created"
        );
        if let Some(container_id) = &container.container_id {
            if let Err(e) = state
                .runtime
                .kill_container(&container.docker_host, container_id)
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to kill orphaned container");
            }
        }
        return Ok(());
    }

    if let Some(updated) = state.store.get_instance(&instance.id).await? {
        state.notifier.instance_updated(&updated, "update").await;
    }
    debug!(
        instance_id = %instance.id,
        container_id = ?container.container_id,
        "Instance container recorded"
    );
    Ok(())
}
