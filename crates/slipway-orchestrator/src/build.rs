// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image build orchestration.
//!
//! A context version's build moves `unstarted → started → completed | failed`,
//! each step a conditional write on the store:
//!
//! 1. [`start_build`] stamps `started` and publishes `createImageBuilderContainer`.
//! 2. [`create_image_builder`] consumes that job and starts the builder container.
//! 3. [`complete_build`] consumes `build.container.died`, records the outcome and
//!    deploys the result to the instances waiting for it.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use slipway_core::graph::{BuildState, ContextVersion, Instance, TriggeredAction};
use slipway_core::jobs::{
    BuildContainerDied, ClearContainerMemory, CreateImageBuilderContainer, InstanceDeployed,
    LABEL_BUILD_ID, LABEL_CONTEXT_VERSION_ID, LABEL_DOCKER_TAG, LABEL_OWNER_USERNAME,
    LABEL_SESSION_USER_GITHUB_ID, PushImage,
};
use slipway_core::persistence::BuildStart;
use tracing::{debug, error, info, warn};

use crate::collaborators::ImageBuilderSpec;
use crate::deploy::{DeployContext, deploy_all, point_at_build};
use crate::error::{Error, Result};
use crate::state::OrchestratorState;

/// Build failure message for exit code 124.
pub const TIMED_OUT_MESSAGE: &str = "Building the image timed out. Please try again.";
/// Build failure message for any other non-zero exit code.
pub const FAILED_MESSAGE: &str = "Building the image failed. Please check your logs.";
/// Build failure message when the builder container could not be created.
pub const MAX_RETRIES_MESSAGE: &str = "Failed to create build container, max retries reached";

/// Trigger message of hook-driven builds that should redeploy tracking instances.
pub const AUTODEPLOY_MESSAGE: &str = "autodeploy";

/// Options for [`start_build`].
#[derive(Debug, Clone, Default)]
pub struct StartBuild {
    /// Dock to build on. Placement picks one when absent.
    pub docker_host: Option<String>,
    /// What caused the build.
    pub triggered_action: TriggeredAction,
    /// Trigger message.
    pub message: Option<String>,
    /// Skip the layer cache.
    pub no_cache: bool,
    /// GitHub id of the acting user.
    pub session_user_github_id: i64,
}

/// Start the build of an unstarted context version.
///
/// Returns as soon as the builder container has been requested.
pub async fn start_build(
    state: &OrchestratorState,
    context_version_id: &str,
    options: &StartBuild,
) -> Result<ContextVersion> {
    let cv = state
        .store
        .get_context_version(context_version_id)
        .await?
        .ok_or_else(|| Error::not_found("ContextVersion", context_version_id))?;
    if cv.build.started.is_some() {
        return Err(Error::IncorrectState(format!(
            "build of context version {} already started",
            cv.id
        )));
    }

    let docks = &state.docks;
    let docker_host = match options.docker_host.as_deref() {
        Some(host) => {
            state
                .settings
                .container_retry
                .run("check dock", move || async move {
                    if docks.is_dock_available(host).await? {
                        Ok(())
                    } else {
                        Err(Error::TransientInfrastructure(format!(
                            "dock {} is not available",
                            host
                        )))
                    }
                })
                .await?;
            host.to_string()
        }
        None => {
            let target = &cv;
            state
                .settings
                .container_retry
                .run("find dock for build", move || async move {
                    Ok(docks.find_dock_for_build(&target.owner, target).await?)
                })
                .await?
        }
    };

    let start = BuildStart {
        started_at: Utc::now(),
        docker_host: docker_host.clone(),
        docker_tag: state.image_tag(&cv),
        triggered_action: options.triggered_action.clone(),
        message: options.message.clone(),
        no_cache: options.no_cache,
    };
    if !state.store.mark_build_started(&cv.id, &start).await? {
        return Err(Error::IncorrectState(format!(
            "build of context version {} already started",
            cv.id
        )));
    }

    state
        .publisher
        .create_image_builder_container(&CreateImageBuilderContainer {
            manual_build: options.triggered_action.manual,
            session_user_github_id: options.session_user_github_id,
            owner_username: cv.owner.username.clone(),
            context_id: cv.context_id.clone(),
            context_version_id: cv.id.clone(),
            docker_host: docker_host.clone(),
            no_cache: options.no_cache,
        })
        .await
        .inspect_err(|e| {
            error!(
                context_version_id = %cv.id,
                error = %e,
                "Build started but builder container request was not published"
            )
        })?;

    info!(
        context_version_id = %cv.id,
        build_id = %cv.build.id,
        docker_host = %docker_host,
        "Build started"
    );

    state
        .store
        .get_context_version(&cv.id)
        .await?
        .ok_or_else(|| Error::not_found("ContextVersion", &cv.id))
}

/// Consume `createImageBuilderContainer`: start the builder container.
///
/// Transient failures are retried in-task; once the attempts are spent the
/// build is failed for good.
pub async fn create_image_builder(
    state: &OrchestratorState,
    job: &CreateImageBuilderContainer,
) -> Result<()> {
    let cv = state
        .store
        .get_context_version(&job.context_version_id)
        .await?
        .ok_or_else(|| Error::not_found("ContextVersion", &job.context_version_id))?;

    if cv.build.state() == BuildState::Failed
        && cv.build.error.as_deref() == Some(MAX_RETRIES_MESSAGE)
    {
        // A previous delivery may have failed the build without finishing it.
        let resumed = resume_abandoned(state, &cv.build.id).await?;
        if !resumed.is_empty() {
            return Ok(());
        }
    }
    if cv.build.state() != BuildState::Started {
        info!(
            context_version_id = %cv.id,
            state = %cv.build.state(),
            "Build is not waiting for a container, skipping"
        );
        return Ok(());
    }
    if let Some(container) = &cv.build.docker_container {
        debug!(context_version_id = %cv.id, container_id = %container, "Builder already created");
        return Ok(());
    }

    let image_tag = cv
        .build
        .docker_tag
        .clone()
        .unwrap_or_else(|| state.image_tag(&cv));
    let labels = HashMap::from([
        (LABEL_BUILD_ID.to_string(), cv.build.id.clone()),
        (LABEL_CONTEXT_VERSION_ID.to_string(), cv.id.clone()),
        (LABEL_OWNER_USERNAME.to_string(), job.owner_username.clone()),
        (
            LABEL_SESSION_USER_GITHUB_ID.to_string(),
            job.session_user_github_id.to_string(),
        ),
        (LABEL_DOCKER_TAG.to_string(), image_tag.clone()),
    ]);
    let spec = ImageBuilderSpec {
        context_version: cv.clone(),
        docker_host: job.docker_host.clone(),
        builder_image: state.settings.builder_image.clone(),
        image_tag,
        labels,
        no_cache: job.no_cache,
    };

    let runtime = &state.runtime;
    let spec = &spec;
    let created = state
        .settings
        .container_retry
        .run("create image builder", move || async move {
            Ok(runtime.create_image_builder(spec).await?)
        })
        .await;

    match created {
        Ok(container_id) => {
            if !state.store.set_build_container(&cv.id, &container_id).await? {
                warn!(
                    context_version_id = %cv.id,
                    container_id = %container_id,
                    "Build finished before its builder container was recorded"
                );
            }
            Ok(())
        }
        Err(e @ (Error::TransientInfrastructure(_) | Error::Rejected(_))) => {
            error!(
                context_version_id = %cv.id,
                error = %e,
                "Giving up on builder container"
            );
            abandon_build(state, &cv.build.id, MAX_RETRIES_MESSAGE).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// What [`complete_build`] did.
#[derive(Debug, Clone, Default)]
pub struct BuildCompletion {
    /// Versions whose follow-up ran. Empty when the event was a duplicate.
    pub context_versions: Vec<ContextVersion>,
    /// The build failed.
    pub failed: bool,
    /// Instances a container was requested for.
    pub deployed: Vec<Instance>,
}

/// Consume `build.container.died`: record the build outcome and deploy it.
///
/// Exit code 0 completes the build; 124 fails it as timed out; anything else
/// fails it generically. The follow-up work (image push, build group update,
/// deploy) runs until the build is marked finalized, so a redelivery after a
/// partial run picks up where it stopped. An event for a finalized build is a
/// no-op.
pub async fn complete_build(
    state: &OrchestratorState,
    job: &BuildContainerDied,
) -> Result<BuildCompletion> {
    let labels = &job.inspect_data;
    let build_id = labels
        .label(LABEL_BUILD_ID)
        .ok_or_else(|| Error::Validation(format!("missing label {}", LABEL_BUILD_ID)))?;
    let owner_username = labels
        .label(LABEL_OWNER_USERNAME)
        .ok_or_else(|| Error::Validation(format!("missing label {}", LABEL_OWNER_USERNAME)))?;
    let session_user = labels.label_i64(LABEL_SESSION_USER_GITHUB_ID).ok_or_else(|| {
        Error::Validation(format!("missing label {}", LABEL_SESSION_USER_GITHUB_ID))
    })?;

    let exit_code = labels.exit_code();
    let now = Utc::now();
    let (mut updated, mut failed) = match exit_code {
        Some(0) => (state.store.complete_build(&build_id, now).await?, false),
        Some(124) => (
            state
                .store
                .fail_build(&build_id, now, TIMED_OUT_MESSAGE)
                .await?,
            true,
        ),
        _ => (
            state.store.fail_build(&build_id, now, FAILED_MESSAGE).await?,
            true,
        ),
    };

    if updated.is_empty() {
        updated = state.store.find_unfinalized_builds(&build_id).await?;
        if updated.is_empty() {
            info!(build_id = %build_id, "Build already finished, ignoring container exit");
            return Ok(BuildCompletion::default());
        }
        // The recorded outcome wins over this event's exit code.
        failed = updated.iter().any(|cv| cv.build.failed);
        warn!(
            build_id = %build_id,
            failed,
            versions = updated.len(),
            "Resuming follow-up of a finished build"
        );
    } else {
        info!(
            build_id = %build_id,
            exit_code = ?exit_code,
            failed,
            versions = updated.len(),
            "Build finished"
        );
    }

    state
        .publisher
        .clear_container_memory(&ClearContainerMemory {
            container_id: job.id.clone(),
        })
        .await?;

    if !failed {
        let image_tag = labels
            .label(LABEL_DOCKER_TAG)
            .or_else(|| updated.iter().find_map(|cv| cv.build.docker_tag.clone()));
        match image_tag {
            Some(image_tag) => {
                state
                    .publisher
                    .push_image(&PushImage {
                        docker_host_url: job.host.clone(),
                        image_tag,
                    })
                    .await?;
            }
            None => warn!(build_id = %build_id, "Completed build has no image tag to push"),
        }
    }

    finish(state, &updated, failed).await?;

    let deployed = deploy_finished(state, &build_id, &updated, failed, session_user, &owner_username)
        .await?;

    state.store.mark_build_finalized(&build_id).await?;

    Ok(BuildCompletion {
        context_versions: updated,
        failed,
        deployed,
    })
}

/// Fail an unfinished build that will never report an exit, and finish it
/// without deploying. Returns the versions that were finished.
///
/// Also completes the follow-up of a build a previous attempt failed but did
/// not finish.
pub(crate) async fn abandon_build(
    state: &OrchestratorState,
    build_id: &str,
    message: &str,
) -> Result<Vec<ContextVersion>> {
    let failed = state.store.fail_build(build_id, Utc::now(), message).await?;
    if failed.is_empty() {
        return resume_abandoned(state, build_id).await;
    }
    finish(state, &failed, true).await?;
    state.store.mark_build_finalized(build_id).await?;
    Ok(failed)
}

async fn resume_abandoned(state: &OrchestratorState, build_id: &str) -> Result<Vec<ContextVersion>> {
    let pending = state.store.find_unfinalized_builds(build_id).await?;
    // A completed build's follow-up belongs to `complete_build`.
    if pending.is_empty() || pending.iter().any(|cv| !cv.build.failed) {
        return Ok(Vec::new());
    }
    warn!(build_id, versions = pending.len(), "Finishing a build abandoned mid-way");
    finish(state, &pending, true).await?;
    state.store.mark_build_finalized(build_id).await?;
    Ok(pending)
}

/// Release claims, update build groups and notify for versions that just finished.
async fn finish(state: &OrchestratorState, finished: &[ContextVersion], failed: bool) -> Result<()> {
    for cv in finished {
        state.store.release_build_claim(&cv.id).await?;
        state.store.mark_builds_finished(&cv.id, failed).await?;
        state.notifier.build_completed(cv).await;
    }
    Ok(())
}

/// True when a finished version should redeploy instances tracking its branch.
pub fn is_autodeploy(cv: &ContextVersion) -> bool {
    let hook_triggered = cv
        .build
        .triggered_action
        .as_ref()
        .is_some_and(|action| !action.manual);
    hook_triggered && cv.build.message.as_deref() == Some(AUTODEPLOY_MESSAGE)
}

/// Push a finished build to the instances waiting for it.
///
/// Explicit targets are the instances already pointing at the build.
/// Autodeploy builds also reach unlocked instances tracking the same branch.
/// An instance that is both is handled once. Every target is pointed at the
/// build and isolated masters are swapped for a group kill, whatever the
/// outcome. Only a successful build gets containers; after a failure the
/// autodeployed instances are announced as deployed so listeners see the
/// failed version.
async fn deploy_finished(
    state: &OrchestratorState,
    build_id: &str,
    finished: &[ContextVersion],
    failed: bool,
    session_user: i64,
    owner_username: &str,
) -> Result<Vec<Instance>> {
    let Some(first) = finished.first() else {
        return Ok(Vec::new());
    };
    let version_for = |instance: &Instance| -> ContextVersion {
        finished
            .iter()
            .find(|cv| cv.id == instance.context_version.id)
            .unwrap_or(first)
            .clone()
    };

    let Some(group_build_id) = state
        .store
        .find_builds_by_context_version_ids(std::slice::from_ref(&first.id))
        .await?
        .pop()
        .map(|build| build.id)
    else {
        warn!(build_id = %build_id, "Finished version belongs to no build group");
        return Ok(Vec::new());
    };

    let explicit = state.store.find_instances_by_cv_build_id(build_id).await?;
    let mut seen: HashSet<String> = explicit.iter().map(|i| i.id.clone()).collect();
    let mut targets: Vec<(Instance, ContextVersion)> = explicit
        .into_iter()
        .map(|instance| {
            let cv = version_for(&instance);
            (instance, cv)
        })
        .collect();
    let mut autodeployed = HashSet::new();

    for cv in finished.iter().filter(|cv| is_autodeploy(cv)) {
        let pushed: Vec<(String, String)> = match cv
            .build
            .triggered_action
            .as_ref()
            .and_then(|action| action.app_code_version.as_ref())
        {
            Some(acv) => vec![(acv.repo.clone(), acv.branch.clone())],
            None => cv
                .app_code_versions
                .iter()
                .map(|acv| (acv.repo.clone(), acv.branch.clone()))
                .collect(),
        };

        for (repo, branch) in pushed {
            let tracking = state
                .store
                .find_instances_tracking_branch(&cv.context_id, &repo, &branch)
                .await?;
            for instance in tracking {
                if instance.locked || !seen.insert(instance.id.clone()) {
                    continue;
                }
                debug!(
                    instance_id = %instance.id,
                    repo = %repo,
                    branch = %branch,
                    "Autodeploying to tracking instance"
                );
                autodeployed.insert(instance.id.clone());
                targets.push((instance, cv.clone()));
            }
        }
    }

    if targets.is_empty() {
        debug!(build_id = %build_id, "No instances to deploy");
        return Ok(Vec::new());
    }

    if !failed {
        let context = DeployContext {
            force_dock: None,
            session_user_github_id: session_user,
            owner_username: owner_username.to_string(),
        };
        return deploy_all(state, &group_build_id, targets, &context).await;
    }

    for instance in point_at_build(state, &group_build_id, targets).await? {
        if autodeployed.contains(&instance.id)
            && let Err(e) = state
                .publisher
                .instance_deployed(&InstanceDeployed {
                    instance_id: instance.id.clone(),
                    cv_id: instance.context_version.id.clone(),
                })
                .await
        {
            error!(instance_id = %instance.id, error = %e, "Failed to announce failed deploy");
        }
        state.notifier.instance_updated(&instance, "update").await;
    }
    Ok(Vec::new())
}
