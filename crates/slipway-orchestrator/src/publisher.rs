// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed publishing onto the durable job table.

use std::sync::Arc;

use serde::Serialize;
use slipway_core::Store;
use slipway_core::jobs::{
    ClearContainerMemory, CreateImageBuilderContainer, CreateInstanceContainer, InstanceDeployed,
    InstanceRebuild, KillIsolation, PushImage, queue,
};
use tracing::debug;

use crate::error::Result;

/// Publishes jobs. One typed method per outbound job.
#[derive(Clone)]
pub struct JobPublisher {
    store: Arc<dyn Store>,
    max_attempts: i32,
}

impl JobPublisher {
    /// Publisher whose jobs are delivered at most `max_attempts` times.
    pub fn new(store: Arc<dyn Store>, max_attempts: i32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    /// Publish any payload onto `queue`. Also used to inject inbound events.
    pub async fn publish<T: Serialize + ?Sized>(&self, queue: &str, payload: &T) -> Result<i64> {
        let payload = serde_json::to_value(payload)?;
        let id = self
            .store
            .enqueue_job(queue, &payload, self.max_attempts)
            .await?;
        debug!(queue, job_id = id, "Job published");
        Ok(id)
    }

    /// `createInstanceContainer`
    pub async fn create_instance_container(&self, job: &CreateInstanceContainer) -> Result<i64> {
        self.publish(queue::CREATE_INSTANCE_CONTAINER, job).await
    }

    /// `createImageBuilderContainer`
    pub async fn create_image_builder_container(
        &self,
        job: &CreateImageBuilderContainer,
    ) -> Result<i64> {
        self.publish(queue::CREATE_IMAGE_BUILDER_CONTAINER, job)
            .await
    }

    /// `instanceDeployed`, delivered on the `instance.deployed` queue.
    pub async fn instance_deployed(&self, job: &InstanceDeployed) -> Result<i64> {
        self.publish(queue::INSTANCE_DEPLOYED, job).await
    }

    /// `instance.rebuild`
    pub async fn instance_rebuild(&self, job: &InstanceRebuild) -> Result<i64> {
        self.publish(queue::INSTANCE_REBUILD, job).await
    }

    /// `killIsolation`
    pub async fn kill_isolation(&self, job: &KillIsolation) -> Result<i64> {
        self.publish(queue::KILL_ISOLATION, job).await
    }

    /// `clearContainerMemory`
    pub async fn clear_container_memory(&self, job: &ClearContainerMemory) -> Result<i64> {
        self.publish(queue::CLEAR_CONTAINER_MEMORY, job).await
    }

    /// `pushImage`
    pub async fn push_image(&self, job: &PushImage) -> Result<i64> {
        self.publish(queue::PUSH_IMAGE, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::SqliteStore;
    use slipway_core::jobs::JobStatus;
    use slipway_core::persistence::JobQueue;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Arc<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        slipway_core::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn test_typed_methods_pick_the_queue() {
        let store = test_store().await;
        let publisher = JobPublisher::new(store.clone(), 3);

        publisher
            .kill_isolation(&KillIsolation {
                isolation_id: "iso-1".to_string(),
                trigger_redeploy: true,
            })
            .await
            .unwrap();
        publisher
            .instance_deployed(&InstanceDeployed {
                instance_id: "i-1".to_string(),
                cv_id: "cv-1".to_string(),
            })
            .await
            .unwrap();

        let kills = store.list_jobs(queue::KILL_ISOLATION, None).await.unwrap();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].status, JobStatus::Pending.as_str());
        assert_eq!(kills[0].max_attempts, 3);
        let job: KillIsolation = kills[0].decode().unwrap();
        assert!(job.trigger_redeploy);

        let deployed = store.list_jobs("instance.deployed", None).await.unwrap();
        assert_eq!(deployed.len(), 1);
    }
}
