// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for slipway-core.
//!
//! Each entity of the resource graph has its own repository trait. [`Store`]
//! bundles them, and is what the orchestrator holds as `Arc<dyn Store>`.
//!
//! Every state transition that two workers could race on is a conditional
//! update: the method returns `bool` (or the rows it moved) and callers treat
//! `false` as "someone else got there first".

pub mod postgres;
mod rows;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::graph::{
    Build, ContainerInfo, Context, ContextVersion, Instance, Isolation, IsolationState, User,
};
use crate::jobs::JobRecord;

/// Fields stamped on a context version when its build starts.
#[derive(Debug, Clone)]
pub struct BuildStart {
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Dock the build runs on.
    pub docker_host: String,
    /// Image tag the build produces.
    pub docker_tag: String,
    /// What caused the build.
    pub triggered_action: crate::graph::TriggeredAction,
    /// Trigger message.
    pub message: Option<String>,
    /// Skip the layer cache.
    pub no_cache: bool,
}

/// The in-progress build holding a dedup key.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BuildClaim {
    /// Owner GitHub id.
    pub owner_github_id: i64,
    /// Dedup content key.
    pub content_key: String,
    /// Context version building under this key.
    pub context_version_id: String,
    /// Dock it builds on.
    pub docker_host: String,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
    /// Image-builder container, once created.
    pub container_id: Option<String>,
}

/// Users keyed by GitHub id.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert or replace a user.
    async fn upsert_user(&self, user: &User) -> Result<(), CoreError>;

    /// Look a user up by GitHub id.
    async fn find_user_by_github_id(&self, github_id: i64) -> Result<Option<User>, CoreError>;
}

/// Build templates.
#[async_trait]
pub trait ContextRepository: Send + Sync {
    /// Insert a context.
    async fn insert_context(&self, context: &Context) -> Result<(), CoreError>;

    /// Get a context by id.
    async fn get_context(&self, id: &str) -> Result<Option<Context>, CoreError>;
}

/// Buildable snapshots and their build sub-records.
#[async_trait]
pub trait ContextVersionRepository: Send + Sync {
    /// Insert a context version.
    async fn insert_context_version(&self, cv: &ContextVersion) -> Result<(), CoreError>;

    /// Get a context version by id.
    async fn get_context_version(&self, id: &str) -> Result<Option<ContextVersion>, CoreError>;

    /// All context versions carrying the given build sub-record id.
    async fn find_context_versions_by_build_id(
        &self,
        build_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Delete a context version whose build never started. Returns true if deleted.
    async fn delete_unstarted_context_version(&self, id: &str) -> Result<bool, CoreError>;

    /// Stamp `build.started`, only if it is not already set.
    async fn mark_build_started(&self, id: &str, start: &BuildStart) -> Result<bool, CoreError>;

    /// Record the image-builder container of a started, unfinished build.
    async fn set_build_container(&self, id: &str, container_id: &str) -> Result<bool, CoreError>;

    /// Move every started, unfinished version with this build id to completed.
    ///
    /// Returns the versions that transitioned; an empty list means the build was
    /// already terminal (or never started).
    async fn complete_build(
        &self,
        build_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Move every started, unfinished version with this build id to failed.
    async fn fail_build(
        &self,
        build_id: &str,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Take the dedup claim for `(owner, content_key)`, or report who holds it.
    ///
    /// A claim whose build never got a container and is older than
    /// `stale_before` is taken over. The returned claim names the winner.
    async fn claim_build(
        &self,
        owner_github_id: i64,
        content_key: &str,
        context_version_id: &str,
        docker_host: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<BuildClaim, CoreError>;

    /// Drop the claim held by a context version, if any.
    async fn release_build_claim(&self, context_version_id: &str) -> Result<(), CoreError>;

    /// Most suitable successfully completed duplicate for a dedup key.
    ///
    /// Versions built on `preferred_dock` come first, then the most recently started.
    async fn find_completed_duplicate(
        &self,
        owner_github_id: i64,
        content_key: &str,
        exclude_id: &str,
        preferred_dock: Option<&str>,
    ) -> Result<Option<ContextVersion>, CoreError>;

    /// Finished versions with this build id whose follow-up work is not yet recorded as done.
    async fn find_unfinalized_builds(
        &self,
        build_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Record that the follow-up work of a finished build is done.
    async fn mark_build_finalized(&self, build_id: &str) -> Result<u64, CoreError>;

    /// Flag every version built on `docker_host` as having lost its dock.
    async fn mark_dock_removed(&self, docker_host: &str) -> Result<u64, CoreError>;

    /// Started, unfinished versions building on `docker_host`.
    async fn find_building_versions_on_dock(
        &self,
        docker_host: &str,
    ) -> Result<Vec<ContextVersion>, CoreError>;
}

/// Build groups.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Insert a build.
    async fn insert_build(&self, build: &Build) -> Result<(), CoreError>;

    /// Get a build by id.
    async fn get_build(&self, id: &str) -> Result<Option<Build>, CoreError>;

    /// Builds containing any of the given context versions.
    async fn find_builds_by_context_version_ids(
        &self,
        context_version_ids: &[String],
    ) -> Result<Vec<Build>, CoreError>;

    /// Delete a build that no instance references. Returns true if deleted.
    async fn delete_unreferenced_build(&self, id: &str) -> Result<bool, CoreError>;

    /// Mark every build containing the version as finished.
    async fn mark_builds_finished(
        &self,
        context_version_id: &str,
        failed: bool,
    ) -> Result<u64, CoreError>;
}

/// Deployment units.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert an instance. Duplicate names or short hashes yield [`CoreError::Conflict`].
    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError>;

    /// Get an instance by id.
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, CoreError>;

    /// Get an instance by owner and short hash.
    async fn get_instance_by_short_hash(
        &self,
        owner_github_id: i64,
        short_hash: &str,
    ) -> Result<Option<Instance>, CoreError>;

    /// Instances whose current container descriptor names `docker_host`.
    async fn find_instances_with_container_on(
        &self,
        docker_host: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Instances referencing a build group.
    async fn find_instances_by_build(&self, build_id: &str) -> Result<Vec<Instance>, CoreError>;

    /// Instances whose context version carries the given build sub-record id.
    async fn find_instances_by_cv_build_id(
        &self,
        cv_build_id: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Instances of a context tracking a repository branch (case-insensitive).
    async fn find_instances_tracking_branch(
        &self,
        context_id: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Members of an isolation.
    async fn find_instances_by_isolation(
        &self,
        isolation_id: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Instances forked from the given parent.
    async fn find_instances_by_parent(
        &self,
        owner_github_id: i64,
        parent_short_hash: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Point an instance at a build and a copy of its context version.
    ///
    /// The container descriptor is left untouched. Returns the updated instance,
    /// or `None` if it no longer exists.
    async fn set_instance_deployment(
        &self,
        id: &str,
        build_id: &str,
        context_version: &ContextVersion,
    ) -> Result<Option<Instance>, CoreError>;

    /// Record a container, only if the instance still uses `context_version_id`.
    async fn set_instance_container(
        &self,
        id: &str,
        context_version_id: &str,
        container: &ContainerInfo,
    ) -> Result<bool, CoreError>;

    /// Mark the current container as stopping, only if it is still `container_id`.
    async fn mark_container_stopping(&self, id: &str, container_id: &str)
    -> Result<bool, CoreError>;

    /// Mark the current container dead, only if it is still `container_id`.
    async fn mark_container_died(
        &self,
        id: &str,
        container_id: &str,
        exit_code: Option<i64>,
    ) -> Result<Option<Instance>, CoreError>;

    /// Record network details, only if the current container is still `container_id`.
    async fn set_instance_network(
        &self,
        id: &str,
        container_id: &str,
        network_ip: &str,
        host_ip: Option<&str>,
        ports: Option<&serde_json::Value>,
    ) -> Result<Option<Instance>, CoreError>;

    /// Put an instance in (or take it out of) an isolation.
    ///
    /// A second master for the same isolation yields [`CoreError::Conflict`].
    async fn set_instance_isolation(
        &self,
        id: &str,
        isolation_id: Option<&str>,
        is_master: bool,
    ) -> Result<bool, CoreError>;
}

/// Isolation groups.
#[async_trait]
pub trait IsolationRepository: Send + Sync {
    /// Insert an isolation.
    async fn insert_isolation(&self, isolation: &Isolation) -> Result<(), CoreError>;

    /// Get an isolation by id.
    async fn get_isolation(&self, id: &str) -> Result<Option<Isolation>, CoreError>;

    /// Get an isolation by id, only if it redeploys when killed.
    async fn find_redeploying_isolation(&self, id: &str) -> Result<Option<Isolation>, CoreError>;

    /// Move an isolation to `to` if it is currently in one of `from`.
    ///
    /// `redeploy_pending` is overwritten when provided.
    async fn transition_isolation(
        &self,
        id: &str,
        from: &[IsolationState],
        to: IsolationState,
        redeploy_pending: Option<bool>,
    ) -> Result<bool, CoreError>;
}

/// The durable job table.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns its id.
    async fn enqueue_job(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        max_attempts: i32,
    ) -> Result<i64, CoreError>;

    /// Claim up to `limit` due pending jobs from the given queues.
    ///
    /// Each job is claimed with a conditional update, so concurrent workers never
    /// receive the same job. Claiming counts as a delivery attempt.
    async fn claim_due_jobs(
        &self,
        queues: &[&str],
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, CoreError>;

    /// Mark a running job done.
    async fn complete_job(&self, id: i64) -> Result<(), CoreError>;

    /// Put a running job back to pending, due at `available_at`.
    async fn retry_job(
        &self,
        id: i64,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Dead-letter a job.
    async fn fail_job(&self, id: i64, error: &str) -> Result<(), CoreError>;

    /// Requeue jobs left running since before `older_than`. Returns how many.
    async fn requeue_stale_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Jobs of a queue in insertion order, optionally filtered by status.
    async fn list_jobs(
        &self,
        queue: &str,
        status: Option<&str>,
    ) -> Result<Vec<JobRecord>, CoreError>;
}

/// The complete resource graph store.
#[async_trait]
pub trait Store:
    UserRepository
    + ContextRepository
    + ContextVersionRepository
    + BuildRepository
    + InstanceRepository
    + IsolationRepository
    + JobQueue
{
    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
