// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dock removal.
//!
//! When a dock leaves the fleet everything it ran is gone. [`handle_dock_removed`]
//! flags the versions built there, moves live instance containers to another
//! dock and restarts builds that were in flight on it.

use futures::future::join_all;
use slipway_core::graph::{BuildState, ContainerState, Instance};
use slipway_core::jobs::{DockRemoved, InstanceRebuild};
use tracing::{debug, error, info, warn};

use crate::build::abandon_build;
use crate::deploy::{container_job, resolve_container_dock};
use crate::error::{Error, Result};
use crate::state::OrchestratorState;

/// Build failure message for builds stranded on a removed dock.
pub const DOCK_REMOVED_MESSAGE: &str = "The dock running this build was removed";

/// What [`handle_dock_removed`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockRemoval {
    /// Context versions flagged as built on a removed dock.
    pub marked: u64,
    /// Instances a replacement container was requested for.
    pub redeployed: Vec<String>,
    /// Instances a rebuild was requested for.
    pub rebuilt: Vec<String>,
}

/// Consume `dock.removed`.
///
/// Every instance is handled independently. Failures are logged and the last
/// one is returned so the job is delivered again; instances already handled
/// are skipped on the next delivery.
pub async fn handle_dock_removed(
    state: &OrchestratorState,
    job: &DockRemoved,
) -> Result<DockRemoval> {
    let marked = state.store.mark_dock_removed(&job.host).await?;
    info!(docker_host = %job.host, context_versions = marked, "Dock removed");

    let (redeploys, rebuilds) = tokio::join!(
        redeploy_from(state, &job.host),
        rebuild_from(state, &job.host)
    );
    let (redeployed, redeploy_error) = redeploys?;
    let (rebuilt, rebuild_error) = rebuilds?;

    info!(
        docker_host = %job.host,
        redeployed = redeployed.len(),
        rebuilt = rebuilt.len(),
        "Dock removal handled"
    );
    if let Some(e) = rebuild_error.or(redeploy_error) {
        return Err(e);
    }
    Ok(DockRemoval {
        marked,
        redeployed,
        rebuilt,
    })
}

type Handled = (Vec<String>, Option<Error>);

fn collect(results: Vec<std::result::Result<Option<String>, (String, Error)>>, what: &str) -> Handled {
    let mut handled = Vec::new();
    let mut last_error = None;
    for result in results {
        match result {
            Ok(Some(instance_id)) => handled.push(instance_id),
            Ok(None) => {}
            Err((instance_id, e)) => {
                error!(instance_id = %instance_id, error = %e, "Failed to {} instance", what);
                last_error = Some(e);
            }
        }
    }
    (handled, last_error)
}

/// Request a replacement container for every live container on the dock.
async fn redeploy_from(state: &OrchestratorState, docker_host: &str) -> Result<Handled> {
    let instances = state
        .store
        .find_instances_with_container_on(docker_host)
        .await?;
    let results = join_all(
        instances
            .into_iter()
            .map(|instance| async move { redeploy(state, instance).await }),
    )
    .await;
    Ok(collect(results, "redeploy"))
}

async fn redeploy(
    state: &OrchestratorState,
    instance: Instance,
) -> std::result::Result<Option<String>, (String, Error)> {
    let Some(container) = instance.container.clone() else {
        return Ok(None);
    };
    let Some(container_id) = container.container_id.clone() else {
        return Ok(None);
    };

    let result: Result<Option<String>> = async {
        match container.state {
            ContainerState::Dead => return Ok(None),
            ContainerState::Stopping => {
                // Already on its way out; the dock took it down.
                if let Some(updated) = state
                    .store
                    .mark_container_died(&instance.id, &container_id, None)
                    .await?
                {
                    state.notifier.instance_updated(&updated, "update").await;
                }
                return Ok(None);
            }
            ContainerState::Starting | ContainerState::Running => {}
        }
        if instance.context_version.build.state() != BuildState::Completed {
            debug!(
                instance_id = %instance.id,
                "Instance is waiting for a build, its deploy will replace the container"
            );
            return Ok(None);
        }

        let docker_host = resolve_container_dock(state, &instance, None).await?;
        let job = container_job(
            &instance,
            &docker_host,
            instance.created_by,
            &instance.owner.username,
        );
        state.publisher.create_instance_container(&job).await?;

        let updated = state
            .store
            .mark_container_died(&instance.id, &container_id, None)
            .await?;
        state
            .notifier
            .instance_updated(updated.as_ref().unwrap_or(&instance), "update")
            .await;
        info!(
            instance_id = %instance.id,
            old_container_id = %container_id,
            docker_host = %docker_host,
            "Redeploying instance off removed dock"
        );
        Ok(Some(instance.id.clone()))
    }
    .await;

    result.map_err(|e| (instance.id, e))
}

/// Rebuild the instances of every build in flight on the dock, then fail those builds.
async fn rebuild_from(state: &OrchestratorState, docker_host: &str) -> Result<Handled> {
    let stranded = state
        .store
        .find_building_versions_on_dock(docker_host)
        .await?;

    let mut rebuilt = Vec::new();
    let mut last_error = None;
    for cv in stranded {
        let instances = state.store.find_instances_by_cv_build_id(&cv.build.id).await?;
        let results = join_all(
            instances
                .into_iter()
                .map(|instance| async move { rebuild(state, instance).await }),
        )
        .await;
        let (handled, error) = collect(results, "rebuild");
        rebuilt.extend(handled);

        if let Some(e) = error {
            // Keep the build open so the next delivery finds these instances again.
            last_error = Some(e);
            continue;
        }
        let abandoned = abandon_build(state, &cv.build.id, DOCK_REMOVED_MESSAGE).await?;
        if abandoned.is_empty() {
            warn!(context_version_id = %cv.id, "Build finished while its dock was removed");
        }
    }
    Ok((rebuilt, last_error))
}

async fn rebuild(
    state: &OrchestratorState,
    instance: Instance,
) -> std::result::Result<Option<String>, (String, Error)> {
    let result = state
        .publisher
        .instance_rebuild(&InstanceRebuild {
            instance_id: instance.id.clone(),
        })
        .await;
    match result {
        Ok(_) => {
            state.notifier.instance_updated(&instance, "update").await;
            debug!(instance_id = %instance.id, "Rebuild requested for instance on removed dock");
            Ok(Some(instance.id))
        }
        Err(e) => Err((instance.id, e)),
    }
}
