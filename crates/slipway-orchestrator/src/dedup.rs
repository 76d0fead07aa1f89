// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build deduplication.
//!
//! [`request_build`] creates a placeholder context version and build for the
//! requested sources, then asks the store for the dedup claim on the sources'
//! content key. Exactly one concurrent request wins the claim and starts the
//! build; every other request gets the winner's context version back and
//! discards its placeholder. A request that wins the claim but finds an
//! already-completed build of the same sources reuses that build instead.

use chrono::Utc;
use slipway_core::graph::{
    AppCodeVersion, Build, BuildRecord, ContextVersion, InfraCodeVersion, TriggeredAction, new_id,
};
use tracing::{debug, info, warn};

use crate::build::{StartBuild, start_build};
use crate::error::{Error, Result};
use crate::state::OrchestratorState;

/// Sources and options of a build request.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Context to build.
    pub context_id: String,
    /// Repository checkouts.
    pub app_code_versions: Vec<AppCodeVersion>,
    /// Dockerfile reference.
    pub infra_code_version: InfraCodeVersion,
    /// Non-repository version.
    pub advanced: bool,
    /// GitHub id of the requesting user.
    pub created_by: i64,
    /// Dock to build on. Placement picks one when absent.
    pub docker_host: Option<String>,
    /// Skip dedup and the layer cache.
    pub no_cache: bool,
    /// What caused the build.
    pub triggered_action: TriggeredAction,
    /// Trigger message (`autodeploy`, `autofork`, ...).
    pub message: Option<String>,
}

/// Result of [`request_build`].
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The context version that builds (or built) these sources.
    pub context_version: ContextVersion,
    /// The build group containing it.
    pub build: Build,
    /// True when an existing build was reused instead of starting a new one.
    pub deduped: bool,
}

/// Request a build of the given sources, reusing an equivalent build when possible.
pub async fn request_build(state: &OrchestratorState, request: BuildRequest) -> Result<BuildOutcome> {
    let context = state
        .store
        .get_context(&request.context_id)
        .await?
        .ok_or_else(|| Error::not_found("Context", &request.context_id))?;

    let now = Utc::now();
    let cv = ContextVersion {
        id: new_id(),
        context_id: context.id.clone(),
        owner: context.owner.clone(),
        created_by: request.created_by,
        app_code_versions: request.app_code_versions,
        infra_code_version: request.infra_code_version,
        advanced: request.advanced,
        build: BuildRecord::unstarted(),
        created_at: now,
    };
    state.store.insert_context_version(&cv).await?;

    let build = Build {
        id: new_id(),
        owner: context.owner.clone(),
        created_by: request.created_by,
        context_version_ids: vec![cv.id.clone()],
        completed: false,
        failed: false,
        created_at: now,
    };
    state.store.insert_build(&build).await?;

    let docker_host = match request.docker_host {
        Some(host) => host,
        None => {
            let docks = &state.docks;
            let (owner, placeholder) = (&cv.owner, &cv);
            state
                .settings
                .container_retry
                .run("find dock for build", move || async move {
                    Ok(docks.find_dock_for_build(owner, placeholder).await?)
                })
                .await?
        }
    };

    if !request.no_cache {
        let content_key = cv.content_key();
        let ttl = chrono::Duration::from_std(state.settings.pending_build_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let claim = state
            .store
            .claim_build(
                cv.owner.github_id,
                &content_key,
                &cv.id,
                &docker_host,
                now,
                now - ttl,
            )
            .await?;

        if claim.context_version_id != cv.id {
            info!(
                context_version_id = %claim.context_version_id,
                placeholder_id = %cv.id,
                content_key = %content_key,
                "Build deduped onto in-progress build"
            );
            discard_placeholder(state, &cv.id, &build.id).await;
            let holder = state
                .store
                .get_context_version(&claim.context_version_id)
                .await?
                .ok_or_else(|| Error::not_found("ContextVersion", &claim.context_version_id))?;
            return deduped(state, holder).await;
        }

        if let Some(duplicate) = state
            .store
            .find_completed_duplicate(cv.owner.github_id, &content_key, &cv.id, Some(&docker_host))
            .await?
        {
            info!(
                context_version_id = %duplicate.id,
                placeholder_id = %cv.id,
                content_key = %content_key,
                "Build deduped onto completed build"
            );
            state.store.release_build_claim(&cv.id).await?;
            discard_placeholder(state, &cv.id, &build.id).await;
            return deduped(state, duplicate).await;
        }
    }

    let start = StartBuild {
        docker_host: Some(docker_host),
        triggered_action: request.triggered_action,
        message: request.message,
        no_cache: request.no_cache,
        session_user_github_id: request.created_by,
    };
    let context_version = match start_build(state, &cv.id, &start).await {
        Ok(cv) => cv,
        Err(e) => {
            if let Err(release) = state.store.release_build_claim(&cv.id).await {
                warn!(context_version_id = %cv.id, error = %release, "Failed to release build claim");
            }
            return Err(e);
        }
    };

    Ok(BuildOutcome {
        context_version,
        build,
        deduped: false,
    })
}

async fn deduped(state: &OrchestratorState, cv: ContextVersion) -> Result<BuildOutcome> {
    let build = state
        .store
        .find_builds_by_context_version_ids(std::slice::from_ref(&cv.id))
        .await?
        .pop()
        .ok_or_else(|| Error::not_found("Build", &cv.id))?;
    Ok(BuildOutcome {
        context_version: cv,
        build,
        deduped: true,
    })
}

/// Best-effort removal of a placeholder that lost to a duplicate.
async fn discard_placeholder(state: &OrchestratorState, cv_id: &str, build_id: &str) {
    match state.store.delete_unreferenced_build(build_id).await {
        Ok(deleted) => debug!(build_id, deleted, "Placeholder build discarded"),
        Err(e) => warn!(build_id, error = %e, "Failed to delete placeholder build"),
    }
    match state.store.delete_unstarted_context_version(cv_id).await {
        Ok(deleted) => debug!(context_version_id = cv_id, deleted, "Placeholder version discarded"),
        Err(e) => warn!(context_version_id = cv_id, error = %e, "Failed to delete placeholder version"),
    }
}
