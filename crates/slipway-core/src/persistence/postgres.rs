// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::CoreError;
use crate::graph::{
    Build, ContainerInfo, ContainerState, Context, ContextVersion, Instance, Isolation,
    IsolationState, User,
};
use crate::jobs::{JobRecord, JobStatus};

use super::rows::{
    BUILD_COLUMNS, BuildMemberRow, BuildRow, CONTEXT_COLUMNS, CV_COLUMNS, ContextRow,
    ContextVersionRow, INSTANCE_COLUMNS, ISOLATION_COLUMNS, InstanceRow, IsolationRow,
    JOB_COLUMNS, UserRow, members_of, tracked_branches,
};
use super::{
    BuildClaim, BuildRepository, BuildStart, ContextRepository, ContextVersionRepository,
    InstanceRepository, IsolationRepository, JobQueue, Store, UserRepository,
};

/// Attempts at a compare-and-swap on an instance container before giving up.
const CONTAINER_CAS_ATTEMPTS: usize = 5;

/// PostgreSQL-backed resource graph store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        crate::migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_instance_row(&self, id: &str) -> Result<Option<InstanceRow>, CoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn fetch_instances(
        &self,
        filter: &str,
        binds: &[&str],
    ) -> Result<Vec<Instance>, CoreError> {
        let sql = format!(
            "SELECT {} FROM instances WHERE {} ORDER BY created_at, id",
            INSTANCE_COLUMNS, filter
        );
        let mut query = sqlx::query_as::<_, InstanceRow>(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Instance::try_from)
            .collect()
    }

    /// Apply `change` to the instance's container descriptor if its id is still
    /// `container_id`, optionally recording network addresses alongside.
    ///
    /// `change` returns false when there is nothing to do, in which case `None`
    /// is returned. The write is a compare-and-swap on the stored descriptor.
    async fn swap_container<F>(
        &self,
        id: &str,
        container_id: &str,
        network: Option<(&str, Option<&str>)>,
        change: F,
    ) -> Result<Option<Instance>, CoreError>
    where
        F: Fn(&mut ContainerInfo) -> bool + Send + Sync,
    {
        for _ in 0..CONTAINER_CAS_ATTEMPTS {
            let Some(row) = self.fetch_instance_row(id).await? else {
                return Ok(None);
            };
            let Some(stored) = row.container.clone() else {
                return Ok(None);
            };
            let mut instance = Instance::try_from(row)?;
            let Some(container) = instance.container.as_mut() else {
                return Ok(None);
            };
            if container.container_id.as_deref() != Some(container_id) || !change(container) {
                return Ok(None);
            }
            let updated = serde_json::to_string(container)?;
            let (network_ip, host_ip) = match network {
                Some((network_ip, host_ip)) => (Some(network_ip), host_ip),
                None => (None, None),
            };

            let result = sqlx::query(
                r#"
                UPDATE instances
                SET container = $1,
                    network_ip = COALESCE($2, network_ip),
                    host_ip = COALESCE($3, host_ip)
                WHERE id = $4 AND container_id = $5 AND container = $6
                "#,
            )
            .bind(&updated)
            .bind(network_ip)
            .bind(host_ip)
            .bind(id)
            .bind(container_id)
            .bind(&stored)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                if let Some((network_ip, host_ip)) = network {
                    instance.network.network_ip = Some(network_ip.to_string());
                    if let Some(host_ip) = host_ip {
                        instance.network.host_ip = Some(host_ip.to_string());
                    }
                }
                return Ok(Some(instance));
            }

            tracing::debug!(instance_id = %id, "Container descriptor changed concurrently, retrying");
        }

        Err(CoreError::DatabaseError {
            operation: "swap_container".to_string(),
            details: format!("container of instance '{}' kept changing", id),
        })
    }

    async fn transition_build(
        &self,
        build_id: &str,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let rows = sqlx::query_as::<_, ContextVersionRow>(&format!(
            r#"
            UPDATE context_versions
            SET build_completed = $1, build_failed = $2, build_error = $3
            WHERE build_id = $4
              AND build_started IS NOT NULL
              AND build_completed IS NULL
              AND build_failed = FALSE
            RETURNING {}
            "#,
            CV_COLUMNS
        ))
        .bind(completed_at)
        .bind(error.is_some())
        .bind(error)
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContextVersion::try_from).collect()
    }
}

#[async_trait]
impl UserRepository for PostgresStore {
    async fn upsert_user(&self, user: &User) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (github_id, username, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (github_id) DO UPDATE
            SET username = excluded.username, email = excluded.email
            "#,
        )
        .bind(user.github_id)
        .bind(&user.username)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_user_by_github_id(&self, github_id: i64) -> Result<Option<User>, CoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT github_id, username, email FROM users WHERE github_id = $1",
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }
}

#[async_trait]
impl ContextRepository for PostgresStore {
    async fn insert_context(&self, context: &Context) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO contexts (id, owner_github_id, owner_username, name, is_source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&context.id)
        .bind(context.owner.github_id)
        .bind(&context.owner.username)
        .bind(&context.name)
        .bind(context.is_source)
        .bind(context.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_write("context", e))?;

        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>, CoreError> {
        let row = sqlx::query_as::<_, ContextRow>(&format!(
            "SELECT {} FROM contexts WHERE id = $1",
            CONTEXT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Context::from))
    }
}

#[async_trait]
impl ContextVersionRepository for PostgresStore {
    async fn insert_context_version(&self, cv: &ContextVersion) -> Result<(), CoreError> {
        let app_code_versions = serde_json::to_string(&cv.app_code_versions)?;
        let triggered_action = cv
            .build
            .triggered_action
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO context_versions (
                id, context_id, owner_github_id, owner_username, created_by,
                app_code_versions, infra_code_version_id, infra_hash, content_key, advanced,
                build_id, build_started, build_completed, build_failed, build_error,
                build_message, triggered_action, docker_host, build_container_id, docker_tag,
                no_cache, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(&cv.id)
        .bind(&cv.context_id)
        .bind(cv.owner.github_id)
        .bind(&cv.owner.username)
        .bind(cv.created_by)
        .bind(app_code_versions)
        .bind(&cv.infra_code_version.id)
        .bind(&cv.infra_code_version.hash)
        .bind(cv.content_key())
        .bind(cv.advanced)
        .bind(&cv.build.id)
        .bind(cv.build.started)
        .bind(cv.build.completed)
        .bind(cv.build.failed)
        .bind(&cv.build.error)
        .bind(&cv.build.message)
        .bind(triggered_action)
        .bind(&cv.build.docker_host)
        .bind(&cv.build.docker_container)
        .bind(&cv.build.docker_tag)
        .bind(cv.build.no_cache)
        .bind(cv.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_write("context_version", e))?;

        Ok(())
    }

    async fn get_context_version(&self, id: &str) -> Result<Option<ContextVersion>, CoreError> {
        let row = sqlx::query_as::<_, ContextVersionRow>(&format!(
            "SELECT {} FROM context_versions WHERE id = $1",
            CV_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ContextVersion::try_from).transpose()
    }

    async fn find_context_versions_by_build_id(
        &self,
        build_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let rows = sqlx::query_as::<_, ContextVersionRow>(&format!(
            "SELECT {} FROM context_versions WHERE build_id = $1 ORDER BY created_at, id",
            CV_COLUMNS
        ))
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContextVersion::try_from).collect()
    }

    async fn delete_unstarted_context_version(&self, id: &str) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM context_versions WHERE id = $1 AND build_started IS NULL")
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_build_started(&self, id: &str, start: &BuildStart) -> Result<bool, CoreError> {
        let triggered_action = serde_json::to_string(&start.triggered_action)?;

        let result = sqlx::query(
            r#"
            UPDATE context_versions
            SET build_started = $1, docker_host = $2, docker_tag = $3,
                triggered_action = $4, build_message = $5, no_cache = $6
            WHERE id = $7 AND build_started IS NULL
            "#,
        )
        .bind(start.started_at)
        .bind(&start.docker_host)
        .bind(&start.docker_tag)
        .bind(triggered_action)
        .bind(&start.message)
        .bind(start.no_cache)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_build_container(&self, id: &str, container_id: &str) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE context_versions
            SET build_container_id = $1
            WHERE id = $2
              AND build_started IS NOT NULL
              AND build_completed IS NULL
              AND build_failed = FALSE
            "#,
        )
        .bind(container_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE build_claims SET container_id = $1 WHERE context_version_id = $2")
            .bind(container_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn complete_build(
        &self,
        build_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        self.transition_build(build_id, completed_at, None).await
    }

    async fn fail_build(
        &self,
        build_id: &str,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        self.transition_build(build_id, completed_at, Some(error))
            .await
    }

    async fn claim_build(
        &self,
        owner_github_id: i64,
        content_key: &str,
        context_version_id: &str,
        docker_host: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<BuildClaim, CoreError> {
        // The holder can release between the insert and the read; go around again.
        for _ in 0..CONTAINER_CAS_ATTEMPTS {
            let won = sqlx::query_as::<_, BuildClaim>(
                r#"
                INSERT INTO build_claims
                    (owner_github_id, content_key, context_version_id, docker_host, claimed_at, container_id)
                VALUES ($1, $2, $3, $4, $5, NULL)
                ON CONFLICT (owner_github_id, content_key) DO UPDATE
                SET context_version_id = excluded.context_version_id,
                    docker_host = excluded.docker_host,
                    claimed_at = excluded.claimed_at,
                    container_id = NULL
                WHERE build_claims.container_id IS NULL
                  AND build_claims.claimed_at < $6
                RETURNING owner_github_id, content_key, context_version_id, docker_host,
                          claimed_at, container_id
                "#,
            )
            .bind(owner_github_id)
            .bind(content_key)
            .bind(context_version_id)
            .bind(docker_host)
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(claim) = won {
                return Ok(claim);
            }

            let holder = sqlx::query_as::<_, BuildClaim>(
                r#"
                SELECT owner_github_id, content_key, context_version_id, docker_host,
                       claimed_at, container_id
                FROM build_claims
                WHERE owner_github_id = $1 AND content_key = $2
                "#,
            )
            .bind(owner_github_id)
            .bind(content_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(claim) = holder {
                return Ok(claim);
            }
        }

        Err(CoreError::DatabaseError {
            operation: "claim_build".to_string(),
            details: format!("claim for key '{}' kept changing hands", content_key),
        })
    }

    async fn release_build_claim(&self, context_version_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM build_claims WHERE context_version_id = $1")
            .bind(context_version_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_completed_duplicate(
        &self,
        owner_github_id: i64,
        content_key: &str,
        exclude_id: &str,
        preferred_dock: Option<&str>,
    ) -> Result<Option<ContextVersion>, CoreError> {
        let row = sqlx::query_as::<_, ContextVersionRow>(&format!(
            r#"
            SELECT {}
            FROM context_versions
            WHERE owner_github_id = $1
              AND content_key = $2
              AND id <> $3
              AND build_completed IS NOT NULL
              AND build_failed = FALSE
            ORDER BY CASE WHEN docker_host = $4 THEN 0 ELSE 1 END, build_started DESC
            LIMIT 1
            "#,
            CV_COLUMNS
        ))
        .bind(owner_github_id)
        .bind(content_key)
        .bind(exclude_id)
        .bind(preferred_dock)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ContextVersion::try_from).transpose()
    }

    async fn find_unfinalized_builds(
        &self,
        build_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let rows = sqlx::query_as::<_, ContextVersionRow>(&format!(
            r#"
            SELECT {} FROM context_versions
            WHERE build_id = $1
              AND (build_completed IS NOT NULL OR build_failed = TRUE)
              AND build_finalized = FALSE
            ORDER BY created_at, id
            "#,
            CV_COLUMNS
        ))
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContextVersion::try_from).collect()
    }

    async fn mark_build_finalized(&self, build_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE context_versions
            SET build_finalized = TRUE
            WHERE build_id = $1
              AND (build_completed IS NOT NULL OR build_failed = TRUE)
              AND build_finalized = FALSE
            "#,
        )
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_dock_removed(&self, docker_host: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE context_versions SET dock_removed = TRUE WHERE docker_host = $1 AND dock_removed = FALSE",
        )
        .bind(docker_host)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_building_versions_on_dock(
        &self,
        docker_host: &str,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let rows = sqlx::query_as::<_, ContextVersionRow>(&format!(
            r#"
            SELECT {} FROM context_versions
            WHERE docker_host = $1
              AND build_started IS NOT NULL
              AND build_completed IS NULL
              AND build_failed = FALSE
            ORDER BY created_at, id
            "#,
            CV_COLUMNS
        ))
        .bind(docker_host)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContextVersion::try_from).collect()
    }
}

#[async_trait]
impl BuildRepository for PostgresStore {
    async fn insert_build(&self, build: &Build) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO builds (id, owner_github_id, owner_username, created_by, completed, failed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&build.id)
        .bind(build.owner.github_id)
        .bind(&build.owner.username)
        .bind(build.created_by)
        .bind(build.completed)
        .bind(build.failed)
        .bind(build.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::from_write("build", e))?;

        for (position, cv_id) in build.context_version_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO build_context_versions (build_id, context_version_id, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&build.id)
            .bind(cv_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_build(&self, id: &str) -> Result<Option<Build>, CoreError> {
        let Some(row) = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE id = $1",
            BUILD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let members = sqlx::query_as::<_, BuildMemberRow>(
            r#"
            SELECT build_id, context_version_id
            FROM build_context_versions
            WHERE build_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(row.into_build(members_of(id, &members))))
    }

    async fn find_builds_by_context_version_ids(
        &self,
        context_version_ids: &[String],
    ) -> Result<Vec<Build>, CoreError> {
        if context_version_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM builds WHERE id IN \
             (SELECT build_id FROM build_context_versions WHERE context_version_id IN (",
            BUILD_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for id in context_version_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")) ORDER BY created_at, id");
        let rows: Vec<BuildRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT build_id, context_version_id FROM build_context_versions WHERE build_id IN (",
        );
        let mut separated = builder.separated(", ");
        for row in &rows {
            separated.push_bind(row.id.clone());
        }
        separated.push_unseparated(") ORDER BY build_id, position");
        let members: Vec<BuildMemberRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let ids = members_of(&row.id, &members);
                row.into_build(ids)
            })
            .collect())
    }

    async fn delete_unreferenced_build(&self, id: &str) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM builds
            WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM instances WHERE build_id = $2)
            "#,
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM build_context_versions WHERE build_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_builds_finished(
        &self,
        context_version_id: &str,
        failed: bool,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET failed = (failed OR $1),
                completed = NOT EXISTS (
                    SELECT 1
                    FROM build_context_versions m
                    JOIN context_versions cv ON cv.id = m.context_version_id
                    WHERE m.build_id = builds.id AND cv.build_completed IS NULL
                )
            WHERE id IN (
                SELECT build_id FROM build_context_versions WHERE context_version_id = $2
            )
            "#,
        )
        .bind(failed)
        .bind(context_version_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InstanceRepository for PostgresStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError> {
        let context_version = serde_json::to_string(&instance.context_version)?;
        let env = serde_json::to_string(&instance.env)?;
        let container = instance
            .container
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let container_id = instance
            .container
            .as_ref()
            .and_then(|c| c.container_id.clone());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, lower_name, short_hash, owner_github_id, owner_username, created_by,
                parent, build_id, context_id, context_version_id, cv_build_id, context_version,
                env, host_ip, network_ip, container, container_id, isolated,
                is_isolation_group_master, locked, master_pod, auto_forked, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(instance.name.to_lowercase())
        .bind(&instance.short_hash)
        .bind(instance.owner.github_id)
        .bind(&instance.owner.username)
        .bind(instance.created_by)
        .bind(&instance.parent)
        .bind(&instance.build_id)
        .bind(&instance.context_version.context_id)
        .bind(&instance.context_version.id)
        .bind(&instance.context_version.build.id)
        .bind(context_version)
        .bind(env)
        .bind(&instance.network.host_ip)
        .bind(&instance.network.network_ip)
        .bind(container)
        .bind(container_id)
        .bind(&instance.isolated)
        .bind(instance.is_isolation_group_master)
        .bind(instance.locked)
        .bind(instance.master_pod)
        .bind(instance.auto_forked)
        .bind(instance.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::from_write("instance", e))?;

        for (repo, branch) in tracked_branches(&instance.context_version) {
            sqlx::query(
                "INSERT INTO instance_branches (instance_id, lower_repo, lower_branch) VALUES ($1, $2, $3)",
            )
            .bind(&instance.id)
            .bind(repo)
            .bind(branch)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, CoreError> {
        self.fetch_instance_row(id)
            .await?
            .map(Instance::try_from)
            .transpose()
    }

    async fn get_instance_by_short_hash(
        &self,
        owner_github_id: i64,
        short_hash: &str,
    ) -> Result<Option<Instance>, CoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE owner_github_id = $1 AND short_hash = $2",
            INSTANCE_COLUMNS
        ))
        .bind(owner_github_id)
        .bind(short_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn find_instances_by_build(&self, build_id: &str) -> Result<Vec<Instance>, CoreError> {
        self.fetch_instances("build_id = $1", &[build_id]).await
    }

    async fn find_instances_with_container_on(
        &self,
        docker_host: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        self.fetch_instances(
            "container IS NOT NULL AND (container::jsonb ->> 'docker_host') = $1",
            &[docker_host],
        )
        .await
    }

    async fn find_instances_by_cv_build_id(
        &self,
        cv_build_id: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        self.fetch_instances("cv_build_id = $1", &[cv_build_id])
            .await
    }

    async fn find_instances_tracking_branch(
        &self,
        context_id: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        let repo = repo.to_lowercase();
        let branch = branch.to_lowercase();
        self.fetch_instances(
            "context_id = $1 AND id IN (SELECT instance_id FROM instance_branches \
             WHERE lower_repo = $2 AND lower_branch = $3)",
            &[context_id, repo.as_str(), branch.as_str()],
        )
        .await
    }

    async fn find_instances_by_isolation(
        &self,
        isolation_id: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        self.fetch_instances("isolated = $1", &[isolation_id]).await
    }

    async fn find_instances_by_parent(
        &self,
        owner_github_id: i64,
        parent_short_hash: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE owner_github_id = $1 AND parent = $2 ORDER BY created_at, id",
            INSTANCE_COLUMNS
        ))
        .bind(owner_github_id)
        .bind(parent_short_hash)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn set_instance_deployment(
        &self,
        id: &str,
        build_id: &str,
        context_version: &ContextVersion,
    ) -> Result<Option<Instance>, CoreError> {
        let serialized = serde_json::to_string(context_version)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET build_id = $1, context_version = $2, context_version_id = $3,
                cv_build_id = $4, context_id = $5
            WHERE id = $6
            "#,
        )
        .bind(build_id)
        .bind(serialized)
        .bind(&context_version.id)
        .bind(&context_version.build.id)
        .bind(&context_version.context_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query("DELETE FROM instance_branches WHERE instance_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for (repo, branch) in tracked_branches(context_version) {
            sqlx::query(
                "INSERT INTO instance_branches (instance_id, lower_repo, lower_branch) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(repo)
            .bind(branch)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_instance(id).await
    }

    async fn set_instance_container(
        &self,
        id: &str,
        context_version_id: &str,
        container: &ContainerInfo,
    ) -> Result<bool, CoreError> {
        let serialized = serde_json::to_string(container)?;

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET container = $1, container_id = $2, network_ip = NULL
            WHERE id = $3 AND context_version_id = $4
            "#,
        )
        .bind(serialized)
        .bind(&container.container_id)
        .bind(id)
        .bind(context_version_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_container_stopping(
        &self,
        id: &str,
        container_id: &str,
    ) -> Result<bool, CoreError> {
        let updated = self
            .swap_container(id, container_id, None, |c| {
                if c.state == ContainerState::Dead || c.state == ContainerState::Stopping {
                    return false;
                }
                c.state = ContainerState::Stopping;
                true
            })
            .await?;

        Ok(updated.is_some())
    }

    async fn mark_container_died(
        &self,
        id: &str,
        container_id: &str,
        exit_code: Option<i64>,
    ) -> Result<Option<Instance>, CoreError> {
        self.swap_container(id, container_id, None, |c| {
            if c.state == ContainerState::Dead {
                return false;
            }
            c.state = ContainerState::Dead;
            c.exit_code = exit_code;
            true
        })
        .await
    }

    async fn set_instance_network(
        &self,
        id: &str,
        container_id: &str,
        network_ip: &str,
        host_ip: Option<&str>,
        ports: Option<&serde_json::Value>,
    ) -> Result<Option<Instance>, CoreError> {
        self.swap_container(id, container_id, Some((network_ip, host_ip)), |c| {
            if c.state == ContainerState::Starting {
                c.state = ContainerState::Running;
            }
            if let Some(ports) = ports {
                c.ports = Some(ports.clone());
            }
            true
        })
        .await
    }

    async fn set_instance_isolation(
        &self,
        id: &str,
        isolation_id: Option<&str>,
        is_master: bool,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE instances SET isolated = $1, is_isolation_group_master = $2 WHERE id = $3",
        )
        .bind(isolation_id)
        .bind(is_master)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_write("instance", e))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl IsolationRepository for PostgresStore {
    async fn insert_isolation(&self, isolation: &Isolation) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO isolations (
                id, owner_github_id, owner_username, created_by, state,
                redeploy_on_killed, redeploy_pending, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&isolation.id)
        .bind(isolation.owner.github_id)
        .bind(&isolation.owner.username)
        .bind(isolation.created_by)
        .bind(isolation.state.as_str())
        .bind(isolation.redeploy_on_killed)
        .bind(isolation.redeploy_pending)
        .bind(isolation.created_at)
        .bind(isolation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_write("isolation", e))?;

        Ok(())
    }

    async fn get_isolation(&self, id: &str) -> Result<Option<Isolation>, CoreError> {
        let row = sqlx::query_as::<_, IsolationRow>(&format!(
            "SELECT {} FROM isolations WHERE id = $1",
            ISOLATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Isolation::try_from).transpose()
    }

    async fn find_redeploying_isolation(&self, id: &str) -> Result<Option<Isolation>, CoreError> {
        let row = sqlx::query_as::<_, IsolationRow>(&format!(
            "SELECT {} FROM isolations WHERE id = $1 AND redeploy_on_killed = TRUE",
            ISOLATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Isolation::try_from).transpose()
    }

    async fn transition_isolation(
        &self,
        id: &str,
        from: &[IsolationState],
        to: IsolationState,
        redeploy_pending: Option<bool>,
    ) -> Result<bool, CoreError> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE isolations SET state = ");
        builder.push_bind(to.as_str());
        builder.push(", redeploy_pending = COALESCE(");
        builder.push_bind(redeploy_pending);
        builder.push(", redeploy_pending), updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND state IN (");
        let mut separated = builder.separated(", ");
        for state in from {
            separated.push_bind(state.as_str());
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobQueue for PostgresStore {
    async fn enqueue_job(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        max_attempts: i32,
    ) -> Result<i64, CoreError> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (queue, payload, status, attempts, max_attempts, available_at, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(payload.to_string())
        .bind(max_attempts)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_due_jobs(
        &self,
        queues: &[&str],
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, CoreError> {
        if queues.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id FROM jobs WHERE status = 'pending' AND available_at <= ");
        builder.push_bind(now);
        builder.push(" AND queue IN (");
        let mut separated = builder.separated(", ");
        for queue in queues {
            separated.push_bind(*queue);
        }
        separated.push_unseparated(") ORDER BY available_at, id LIMIT ");
        separated.push_bind_unseparated(limit);
        let ids: Vec<i64> = builder.build_query_scalar().fetch_all(&self.pool).await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let job = sqlx::query_as::<_, JobRecord>(&format!(
                r#"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1, updated_at = $1
                WHERE id = $2 AND status = 'pending'
                RETURNING {}
                "#,
                JOB_COLUMNS
            ))
            .bind(now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job) = job {
                claimed.push(job);
            }
        }

        Ok(claimed)
    }

    async fn complete_job(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET status = $1, last_error = NULL, updated_at = $2 WHERE id = $3")
            .bind(JobStatus::Done.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn retry_job(
        &self,
        id: i64,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, last_error = $2, available_at = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(JobStatus::Pending.as_str())
        .bind(error)
        .bind(available_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(&self, id: i64, error: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET status = $1, last_error = $2, updated_at = $3 WHERE id = $4")
            .bind(JobStatus::Failed.as_str())
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn requeue_stale_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', updated_at = $1
            WHERE status = 'running' AND updated_at < $2
            "#,
        )
        .bind(Utc::now())
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_jobs(
        &self,
        queue: &str,
        status: Option<&str>,
    ) -> Result<Vec<JobRecord>, CoreError> {
        let jobs = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {} FROM jobs WHERE queue = $1 AND ($2::text IS NULL OR status = $3) ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(queue)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
