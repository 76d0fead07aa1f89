// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types shared by the SQLite and PostgreSQL backends.
//!
//! Nested parts of a record (checkout lists, the denormalised context version
//! of an instance, container descriptors) are stored as JSON text; everything
//! that is queried on lives in its own column.

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::graph::{
    Build, BuildRecord, Context, ContextVersion, InfraCodeVersion, Instance, Isolation,
    NetworkInfo, Owner, User,
};

pub(crate) const CONTEXT_COLUMNS: &str =
    "id, owner_github_id, owner_username, name, is_source, created_at";

pub(crate) const CV_COLUMNS: &str = "id, context_id, owner_github_id, owner_username, created_by, \
     app_code_versions, infra_code_version_id, infra_hash, advanced, build_id, build_started, \
     build_completed, build_failed, build_error, build_message, triggered_action, docker_host, \
     build_container_id, docker_tag, no_cache, created_at";

pub(crate) const BUILD_COLUMNS: &str =
    "id, owner_github_id, owner_username, created_by, completed, failed, created_at";

pub(crate) const INSTANCE_COLUMNS: &str = "id, name, short_hash, owner_github_id, owner_username, \
     created_by, parent, build_id, context_version, env, host_ip, network_ip, container, isolated, \
     is_isolation_group_master, locked, master_pod, auto_forked, created_at";

pub(crate) const ISOLATION_COLUMNS: &str = "id, owner_github_id, owner_username, created_by, state, \
     redeploy_on_killed, redeploy_pending, created_at";

pub(crate) const JOB_COLUMNS: &str = "id, queue, payload, status, attempts, max_attempts, \
     available_at, last_error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UserRow {
    pub github_id: i64,
    pub username: String,
    pub email: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            github_id: row.github_id,
            username: row.username,
            email: row.email,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ContextRow {
    pub id: String,
    pub owner_github_id: i64,
    pub owner_username: String,
    pub name: String,
    pub is_source: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ContextRow> for Context {
    fn from(row: ContextRow) -> Self {
        Context {
            id: row.id,
            owner: Owner {
                github_id: row.owner_github_id,
                username: row.owner_username,
            },
            name: row.name,
            is_source: row.is_source,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ContextVersionRow {
    pub id: String,
    pub context_id: String,
    pub owner_github_id: i64,
    pub owner_username: String,
    pub created_by: i64,
    pub app_code_versions: String,
    pub infra_code_version_id: String,
    pub infra_hash: String,
    pub advanced: bool,
    pub build_id: String,
    pub build_started: Option<DateTime<Utc>>,
    pub build_completed: Option<DateTime<Utc>>,
    pub build_failed: bool,
    pub build_error: Option<String>,
    pub build_message: Option<String>,
    pub triggered_action: Option<String>,
    pub docker_host: Option<String>,
    pub build_container_id: Option<String>,
    pub docker_tag: Option<String>,
    pub no_cache: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ContextVersionRow> for ContextVersion {
    type Error = CoreError;

    fn try_from(row: ContextVersionRow) -> Result<Self, Self::Error> {
        let app_code_versions = serde_json::from_str(&row.app_code_versions)
            .map_err(|e| CoreError::corrupt("context_version", &row.id, e))?;
        let triggered_action = row
            .triggered_action
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| CoreError::corrupt("context_version", &row.id, e))?;

        Ok(ContextVersion {
            id: row.id,
            context_id: row.context_id,
            owner: Owner {
                github_id: row.owner_github_id,
                username: row.owner_username,
            },
            created_by: row.created_by,
            app_code_versions,
            infra_code_version: InfraCodeVersion {
                id: row.infra_code_version_id,
                hash: row.infra_hash,
            },
            advanced: row.advanced,
            build: BuildRecord {
                id: row.build_id,
                started: row.build_started,
                completed: row.build_completed,
                failed: row.build_failed,
                error: row.build_error,
                message: row.build_message,
                triggered_action,
                docker_host: row.docker_host,
                docker_container: row.build_container_id,
                docker_tag: row.docker_tag,
                no_cache: row.no_cache,
            },
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BuildRow {
    pub id: String,
    pub owner_github_id: i64,
    pub owner_username: String,
    pub created_by: i64,
    pub completed: bool,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

impl BuildRow {
    pub fn into_build(self, context_version_ids: Vec<String>) -> Build {
        Build {
            id: self.id,
            owner: Owner {
                github_id: self.owner_github_id,
                username: self.owner_username,
            },
            created_by: self.created_by,
            context_version_ids,
            completed: self.completed,
            failed: self.failed,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BuildMemberRow {
    pub build_id: String,
    pub context_version_id: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    pub id: String,
    pub name: String,
    pub short_hash: String,
    pub owner_github_id: i64,
    pub owner_username: String,
    pub created_by: i64,
    pub parent: Option<String>,
    pub build_id: Option<String>,
    pub context_version: String,
    pub env: String,
    pub host_ip: Option<String>,
    pub network_ip: Option<String>,
    pub container: Option<String>,
    pub isolated: Option<String>,
    pub is_isolation_group_master: bool,
    pub locked: bool,
    pub master_pod: bool,
    pub auto_forked: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let corrupt = |e: serde_json::Error| CoreError::corrupt("instance", &row.id, e);
        let context_version = serde_json::from_str(&row.context_version).map_err(corrupt)?;
        let env = serde_json::from_str(&row.env).map_err(corrupt)?;
        let container = row
            .container
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(corrupt)?;

        Ok(Instance {
            id: row.id,
            name: row.name,
            short_hash: row.short_hash,
            owner: Owner {
                github_id: row.owner_github_id,
                username: row.owner_username,
            },
            created_by: row.created_by,
            parent: row.parent,
            build_id: row.build_id,
            context_version,
            env,
            network: NetworkInfo {
                host_ip: row.host_ip,
                network_ip: row.network_ip,
            },
            container,
            isolated: row.isolated,
            is_isolation_group_master: row.is_isolation_group_master,
            locked: row.locked,
            master_pod: row.master_pod,
            auto_forked: row.auto_forked,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct IsolationRow {
    pub id: String,
    pub owner_github_id: i64,
    pub owner_username: String,
    pub created_by: i64,
    pub state: String,
    pub redeploy_on_killed: bool,
    pub redeploy_pending: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<IsolationRow> for Isolation {
    type Error = CoreError;

    fn try_from(row: IsolationRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse()
            .map_err(|e: String| CoreError::corrupt("isolation", &row.id, e))?;
        Ok(Isolation {
            id: row.id,
            owner: Owner {
                github_id: row.owner_github_id,
                username: row.owner_username,
            },
            created_by: row.created_by,
            state,
            redeploy_on_killed: row.redeploy_on_killed,
            redeploy_pending: row.redeploy_pending,
            created_at: row.created_at,
        })
    }
}

/// Lower-cased `(repo, branch)` pairs an instance tracks.
pub(crate) fn tracked_branches(cv: &ContextVersion) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = cv
        .app_code_versions
        .iter()
        .map(|acv| (acv.repo.to_lowercase(), acv.branch.to_lowercase()))
        .collect();
    pairs.sort();
    pairs.dedup();
    pairs
}

/// Group build member rows into per-build id lists, keeping insertion order.
pub(crate) fn members_of(build_id: &str, members: &[BuildMemberRow]) -> Vec<String> {
    members
        .iter()
        .filter(|m| m.build_id == build_id)
        .map(|m| m.context_version_id.clone())
        .collect()
}
