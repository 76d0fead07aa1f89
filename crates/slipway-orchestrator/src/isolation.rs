// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isolation groups.
//!
//! An isolation is a set of instances killed and redeployed together:
//!
//! ```text
//! created ──kill──▶ killing ──all members dead──▶ killed
//!    ▲                                              │ redeploy pending
//!    └────────────── redeploying ◀──────────────────┘
//! ```
//!
//! The master's container dying (or the master receiving a new build) while
//! its isolation has `redeploy_on_killed` publishes `killIsolation`. Member
//! deaths observed while the isolation is `killing` are the expected
//! consequence of that kill and only advance the state machine.

use chrono::Utc;
use slipway_core::graph::{Instance, Isolation, IsolationState, new_id};
use slipway_core::jobs::{InstanceContainerDied, KillIsolation, LABEL_INSTANCE_ID};
use tracing::{debug, info, warn};

use crate::deploy::{container_job, resolve_container_dock};
use crate::error::{Error, Result};
use crate::fork::{PushInfo, fork_non_repo_instance, fork_repo_instance};
use crate::state::OrchestratorState;

/// Remove isolated masters whose isolation redeploys on kill, killing those isolations.
///
/// Returns the instances that are still safe to deploy normally. Store
/// errors are returned, never swallowed.
pub async fn filter_out_and_kill_isolated_instances(
    state: &OrchestratorState,
    instances: Vec<Instance>,
) -> Result<Vec<Instance>> {
    let mut remaining = Vec::with_capacity(instances.len());
    for instance in instances {
        let isolation_id = match (&instance.isolated, instance.is_isolation_group_master) {
            (Some(isolation_id), true) => isolation_id,
            _ => {
                remaining.push(instance);
                continue;
            }
        };

        match state.store.find_redeploying_isolation(isolation_id).await? {
            Some(isolation) => {
                state
                    .publisher
                    .kill_isolation(&KillIsolation {
                        isolation_id: isolation.id.clone(),
                        trigger_redeploy: true,
                    })
                    .await?;
                info!(
                    instance_id = %instance.id,
                    isolation_id = %isolation.id,
                    "Isolation master changed, killing isolation for redeploy"
                );
            }
            None => remaining.push(instance),
        }
    }
    Ok(remaining)
}

/// Consume `killIsolation`: move the isolation to `killing` and kill every live member.
pub async fn kill_isolation(state: &OrchestratorState, job: &KillIsolation) -> Result<()> {
    let isolation = state
        .store
        .get_isolation(&job.isolation_id)
        .await?
        .ok_or_else(|| Error::not_found("Isolation", &job.isolation_id))?;

    let moved = state
        .store
        .transition_isolation(
            &isolation.id,
            &[
                IsolationState::Created,
                IsolationState::Killing,
                IsolationState::Killed,
                IsolationState::Redeploying,
            ],
            IsolationState::Killing,
            Some(job.trigger_redeploy),
        )
        .await?;
    if !moved {
        debug!(isolation_id = %isolation.id, "Isolation vanished before kill");
        return Ok(());
    }
    info!(
        isolation_id = %isolation.id,
        trigger_redeploy = job.trigger_redeploy,
        "Killing isolation"
    );

    let members = state.store.find_instances_by_isolation(&isolation.id).await?;
    let mut live = 0;
    for member in &members {
        let Some(container) = member.container.as_ref().filter(|c| c.is_alive()) else {
            continue;
        };
        let Some(container_id) = container.container_id.as_deref() else {
            continue;
        };
        live += 1;

        state
            .store
            .mark_container_stopping(&member.id, container_id)
            .await?;

        let runtime = &state.runtime;
        let host = container.docker_host.as_str();
        state
            .settings
            .container_retry
            .run("kill container", move || async move {
                Ok(runtime.kill_container(host, container_id).await?)
            })
            .await?;
        debug!(instance_id = %member.id, container_id, "Member container killed");
    }

    if live == 0 {
        finish_kill(state, &isolation.id).await?;
    }
    Ok(())
}

/// Consume `instance.container.died` / `application.container.died`.
///
/// Records the exit on the instance, then either advances an isolation that
/// is being killed or checks whether this death should kill the instance's
/// isolation.
pub async fn handle_instance_died(state: &OrchestratorState, job: &InstanceContainerDied) -> Result<()> {
    let instance_id = job
        .inspect_data
        .label(LABEL_INSTANCE_ID)
        .ok_or_else(|| Error::Validation(format!("missing label {}", LABEL_INSTANCE_ID)))?;

    let Some(instance) = state
        .store
        .mark_container_died(&instance_id, &job.id, job.inspect_data.exit_code())
        .await?
    else {
        debug!(instance_id = %instance_id, container_id = %job.id, "Stale or duplicate container exit");
        return Ok(());
    };
    info!(
        instance_id = %instance.id,
        container_id = %job.id,
        exit_code = ?job.inspect_data.exit_code(),
        "Instance container died"
    );
    state.notifier.instance_updated(&instance, "update").await;

    if let Some(isolation_id) = &instance.isolated {
        if let Some(isolation) = state.store.get_isolation(isolation_id).await? {
            if isolation.state == IsolationState::Killing {
                let members = state.store.find_instances_by_isolation(&isolation.id).await?;
                let still_alive = members
                    .iter()
                    .filter(|m| m.container.as_ref().is_some_and(|c| c.is_alive()))
                    .count();
                debug!(isolation_id = %isolation.id, still_alive, "Isolation member died during kill");
                if still_alive == 0 {
                    finish_kill(state, &isolation.id).await?;
                }
                return Ok(());
            }
        }
    }

    filter_out_and_kill_isolated_instances(state, vec![instance]).await?;
    Ok(())
}

/// Every member is dead: move to `killed`, then redeploy if that was requested.
async fn finish_kill(state: &OrchestratorState, isolation_id: &str) -> Result<()> {
    if !state
        .store
        .transition_isolation(
            isolation_id,
            &[IsolationState::Killing],
            IsolationState::Killed,
            None,
        )
        .await?
    {
        return Ok(());
    }
    info!(isolation_id, "Isolation killed");

    let isolation = state
        .store
        .get_isolation(isolation_id)
        .await?
        .ok_or_else(|| Error::not_found("Isolation", isolation_id))?;
    if isolation.redeploy_pending {
        redeploy(state, &isolation).await?;
    }
    Ok(())
}

/// Recreate every member's container from its current context version.
async fn redeploy(state: &OrchestratorState, isolation: &Isolation) -> Result<()> {
    if !state
        .store
        .transition_isolation(
            &isolation.id,
            &[IsolationState::Killed],
            IsolationState::Redeploying,
            Some(false),
        )
        .await?
    {
        return Ok(());
    }

    let members = state.store.find_instances_by_isolation(&isolation.id).await?;
    for member in &members {
        let docker_host = resolve_container_dock(state, member, None).await?;
        let job = container_job(
            member,
            &docker_host,
            isolation.created_by,
            &isolation.owner.username,
        );
        state.publisher.create_instance_container(&job).await?;
        state.notifier.instance_updated(member, "redeploy").await;
    }

    state
        .store
        .transition_isolation(
            &isolation.id,
            &[IsolationState::Redeploying],
            IsolationState::Created,
            None,
        )
        .await?;
    info!(isolation_id = %isolation.id, members = members.len(), "Isolation redeployed");
    Ok(())
}

/// A repository instance to fork into an isolation at a given commit.
#[derive(Debug, Clone)]
pub struct RepoChild {
    /// Instance to fork.
    pub instance_id: String,
    /// Checkout to fork at.
    pub push: PushInfo,
}

/// Options for [`isolate`].
#[derive(Debug, Clone)]
pub struct IsolateRequest {
    /// Instance that becomes the isolation master.
    pub master_instance_id: String,
    /// Instances to fork into the isolation as non-repository children.
    pub child_instance_ids: Vec<String>,
    /// Repository instances to fork into the isolation.
    pub repo_children: Vec<RepoChild>,
    /// Kill and redeploy the group when the master dies or changes.
    pub redeploy_on_killed: bool,
    /// GitHub id of the acting user.
    pub session_user_github_id: i64,
}

/// Create an isolation around a master instance and fork children into it.
pub async fn isolate(
    state: &OrchestratorState,
    request: &IsolateRequest,
) -> Result<(Isolation, Vec<Instance>)> {
    let master = state
        .store
        .get_instance(&request.master_instance_id)
        .await?
        .ok_or_else(|| Error::not_found("Instance", &request.master_instance_id))?;
    if let Some(existing) = &master.isolated {
        return Err(Error::IncorrectState(format!(
            "instance {} is already in isolation {}",
            master.id, existing
        )));
    }

    let isolation = Isolation {
        id: new_id(),
        owner: master.owner.clone(),
        created_by: request.session_user_github_id,
        state: IsolationState::Created,
        redeploy_on_killed: request.redeploy_on_killed,
        redeploy_pending: false,
        created_at: Utc::now(),
    };
    state.store.insert_isolation(&isolation).await?;

    if !state
        .store
        .set_instance_isolation(&master.id, Some(&isolation.id), true)
        .await?
    {
        return Err(Error::not_found("Instance", &master.id));
    }
    info!(
        isolation_id = %isolation.id,
        master_instance_id = %master.id,
        "Isolation created"
    );

    let mut children = Vec::new();
    for child_id in &request.child_instance_ids {
        let child = state
            .store
            .get_instance(child_id)
            .await?
            .ok_or_else(|| Error::not_found("Instance", child_id))?;
        let fork = fork_non_repo_instance(
            state,
            &child,
            &master.short_hash,
            &isolation.id,
            request.session_user_github_id,
        )
        .await
        .inspect_err(|e| {
            warn!(isolation_id = %isolation.id, instance_id = %child.id, error = %e, "Failed to fork child into isolation")
        })?;
        children.push(fork);
    }
    for repo_child in &request.repo_children {
        let child = state
            .store
            .get_instance(&repo_child.instance_id)
            .await?
            .ok_or_else(|| Error::not_found("Instance", &repo_child.instance_id))?;
        let fork = fork_repo_instance(
            state,
            &child,
            &repo_child.push,
            &master.short_hash,
            &isolation.id,
        )
        .await
        .inspect_err(|e| {
            warn!(isolation_id = %isolation.id, instance_id = %child.id, error = %e, "Failed to fork child into isolation")
        })?;
        children.push(fork);
    }

    Ok((isolation, children))
}
