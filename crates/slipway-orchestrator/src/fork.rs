// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance forking.
//!
//! A fork is a new instance shaped like its parent but backed by a build of a
//! patched copy of the parent's context version:
//!
//! | Kind | Name | Build message |
//! |------|------|---------------|
//! | branch push ([`fork_instance`]) | `<sanitized branch>-<parent>` | `autofork` |
//! | repository child of an isolation | `<master short hash>--<parent>` | `isolate` |
//! | non-repository child of an isolation | `<master short hash>--<parent>` | `Initial Isolation Build` |
//!
//! Forks are never master pods and are always marked auto-forked.

use chrono::Utc;
use futures::future::join_all;
use slipway_core::graph::{BuildState, Instance, NetworkInfo, TriggeredAction, new_id, new_short_hash};
use tracing::{debug, error, info};

use crate::dedup::{BuildOutcome, BuildRequest, request_build};
use crate::deploy::{DeployContext, deploy_all};
use crate::error::{Error, Result};
use crate::state::OrchestratorState;

/// Short hashes drawn for one new instance before giving up.
const SHORT_HASH_ATTEMPTS: usize = 5;

/// Trigger message of builds created for branch forks.
pub const AUTOFORK_MESSAGE: &str = "autofork";
/// Trigger message of repository forks into an isolation.
pub const ISOLATE_MESSAGE: &str = "isolate";
/// Trigger message of non-repository forks into an isolation.
pub const ISOLATION_BUILD_MESSAGE: &str = "Initial Isolation Build";

/// A push that causes a fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushInfo {
    /// Full repository name, `org/repo`.
    pub repo: String,
    /// Pushed branch.
    pub branch: String,
    /// Pushed commit.
    pub commit: String,
    /// GitHub id of the pushing (or acting) user.
    pub user_github_id: i64,
}

/// Replace every character outside `[A-Za-z0-9-]` with `-`.
pub fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Name of a branch fork.
pub fn branch_fork_name(branch: &str, parent_name: &str) -> String {
    format!("{}-{}", sanitize_branch(branch), parent_name)
}

/// Name of an instance forked into an isolation.
pub fn isolated_fork_name(master_short_hash: &str, parent_name: &str) -> String {
    format!("{}--{}", master_short_hash, parent_name)
}

/// Fork `parent` for a push to a branch it does not track yet.
pub async fn fork_instance(
    state: &OrchestratorState,
    parent: &Instance,
    push: &PushInfo,
) -> Result<Instance> {
    let name = branch_fork_name(&push.branch, &parent.name);
    let request = repo_build_request(parent, push, false, AUTOFORK_MESSAGE)?;
    fork_with_build(state, parent, name, None, request).await
}

/// Fork a repository instance into an isolation at the pushed commit.
pub async fn fork_repo_instance(
    state: &OrchestratorState,
    parent: &Instance,
    push: &PushInfo,
    master_short_hash: &str,
    isolation_id: &str,
) -> Result<Instance> {
    let name = isolated_fork_name(master_short_hash, &parent.name);
    let request = repo_build_request(parent, push, true, ISOLATE_MESSAGE)?;
    fork_with_build(state, parent, name, Some(isolation_id), request).await
}

/// Fork a non-repository instance into an isolation.
///
/// The copy keeps the parent's sources, so its build normally dedupes onto
/// the parent's.
pub async fn fork_non_repo_instance(
    state: &OrchestratorState,
    parent: &Instance,
    master_short_hash: &str,
    isolation_id: &str,
    session_user_github_id: i64,
) -> Result<Instance> {
    let cv = &parent.context_version;
    let request = BuildRequest {
        context_id: cv.context_id.clone(),
        app_code_versions: cv.app_code_versions.clone(),
        infra_code_version: cv.infra_code_version.clone(),
        advanced: true,
        created_by: session_user_github_id,
        docker_host: None,
        no_cache: false,
        triggered_action: TriggeredAction {
            manual: true,
            app_code_version: None,
            rebuild: false,
        },
        message: Some(ISOLATION_BUILD_MESSAGE.to_string()),
    };
    let name = isolated_fork_name(master_short_hash, &parent.name);
    fork_with_build(state, parent, name, Some(isolation_id), request).await
}

/// Fork every instance for the same push.
///
/// Each fork is independent: a failure is logged and leaves `None` at that
/// position. The result always has one entry per input.
pub async fn auto_fork(
    state: &OrchestratorState,
    instances: &[Instance],
    push: &PushInfo,
) -> Vec<Option<Instance>> {
    let forks = instances.iter().map(|instance| async move {
        match fork_instance(state, instance, push).await {
            Ok(fork) => Some(fork),
            Err(e) => {
                error!(
                    instance_id = %instance.id,
                    repo = %push.repo,
                    branch = %push.branch,
                    error = %e,
                    error_kind = e.kind(),
                    "Auto-fork failed"
                );
                None
            }
        }
    });
    join_all(forks).await
}

fn repo_build_request(
    parent: &Instance,
    push: &PushInfo,
    manual: bool,
    message: &str,
) -> Result<BuildRequest> {
    let cv = &parent.context_version;
    let mut app_code_versions = cv.app_code_versions.clone();
    let Some(pushed) = app_code_versions
        .iter_mut()
        .find(|acv| acv.repo.eq_ignore_ascii_case(&push.repo))
    else {
        return Err(Error::IncorrectState(format!(
            "instance {} does not build repository {}",
            parent.id, push.repo
        )));
    };
    pushed.branch = push.branch.clone();
    pushed.commit = push.commit.clone();
    let pushed = pushed.clone();

    Ok(BuildRequest {
        context_id: cv.context_id.clone(),
        app_code_versions,
        infra_code_version: cv.infra_code_version.clone(),
        advanced: cv.advanced,
        created_by: push.user_github_id,
        docker_host: None,
        no_cache: false,
        triggered_action: TriggeredAction {
            manual,
            app_code_version: Some(pushed),
            rebuild: false,
        },
        message: Some(message.to_string()),
    })
}

async fn fork_with_build(
    state: &OrchestratorState,
    parent: &Instance,
    name: String,
    isolation_id: Option<&str>,
    request: BuildRequest,
) -> Result<Instance> {
    let session_user = request.created_by;
    let BuildOutcome {
        context_version,
        build,
        deduped,
    } = request_build(state, request).await?;

    let fork = Instance {
        id: new_id(),
        name,
        short_hash: new_short_hash(),
        owner: parent.owner.clone(),
        created_by: session_user,
        parent: Some(parent.short_hash.clone()),
        build_id: Some(build.id.clone()),
        context_version: context_version.clone(),
        env: parent.env.clone(),
        network: NetworkInfo::default(),
        container: None,
        isolated: isolation_id.map(str::to_string),
        is_isolation_group_master: false,
        locked: false,
        master_pod: false,
        auto_forked: true,
        created_at: Utc::now(),
    };
    let fork = insert_with_free_short_hash(state, fork).await?;
    info!(
        instance_id = %fork.id,
        instance_name = %fork.name,
        parent = %parent.short_hash,
        context_version_id = %context_version.id,
        deduped,
        "Instance forked"
    );
    state.notifier.instance_updated(&fork, "post").await;

    // A build that is still running deploys to the fork when it finishes.
    if context_version.build.state() == BuildState::Completed {
        let context = DeployContext {
            force_dock: None,
            session_user_github_id: session_user,
            owner_username: parent.owner.username.clone(),
        };
        let deployed =
            deploy_all(state, &build.id, vec![(fork.clone(), context_version)], &context).await?;
        if let Some(updated) = deployed.into_iter().next() {
            return Ok(updated);
        }
    }
    Ok(fork)
}

/// Insert a new instance, drawing another short hash while the drawn one is taken.
///
/// Any other conflict, such as a duplicate name, is returned as is.
pub async fn insert_with_free_short_hash(
    state: &OrchestratorState,
    mut instance: Instance,
) -> Result<Instance> {
    for _ in 0..SHORT_HASH_ATTEMPTS {
        let err = match state.store.insert_instance(&instance).await {
            Ok(()) => return Ok(instance),
            Err(e) => Error::from(e),
        };
        if !matches!(err, Error::Conflict(_)) {
            return Err(err);
        }
        let taken = state
            .store
            .get_instance_by_short_hash(instance.owner.github_id, &instance.short_hash)
            .await?;
        if taken.is_none() {
            return Err(err);
        }
        debug!(short_hash = %instance.short_hash, "Short hash taken, drawing another");
        instance.short_hash = new_short_hash();
    }
    Err(Error::Conflict(format!(
        "no free short hash for owner {} after {} attempts",
        instance.owner.github_id, SHORT_HASH_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_branch() {
        assert_eq!(sanitize_branch("feature/add-thing!"), "feature-add-thing-");
        assert_eq!(sanitize_branch("Fix_Bug.2"), "Fix-Bug-2");
        assert_eq!(sanitize_branch("plain-branch-1"), "plain-branch-1");
        assert_eq!(sanitize_branch("ünïcode"), "-n-code");
    }

    #[test]
    fn test_sanitize_is_idempotent_and_domain_safe() {
        for branch in ["a/b/c", "x..y", "  spaced  ", "release@2024#1", "ok"] {
            let once = sanitize_branch(branch);
            assert_eq!(sanitize_branch(&once), once);
            assert!(!once.is_empty());
            assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        }
    }

    #[test]
    fn test_fork_names() {
        assert_eq!(branch_fork_name("feature/add-thing!", "api"), "feature-add-thing--api");
        assert_eq!(isolated_fork_name("abc123", "api"), "abc123--api");
    }
}
