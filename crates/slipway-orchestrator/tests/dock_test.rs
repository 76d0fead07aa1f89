// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dock removal tests: redeploying live containers and rebuilding stranded builds.

mod common;

use common::{DOCK, Harness, acv, builder_died};
use slipway_core::graph::{BuildState, ContainerState};
use slipway_core::jobs::{CreateInstanceContainer, DockRemoved, InstanceRebuild, JobStatus, queue};
use slipway_core::persistence::{BuildRepository, ContextVersionRepository, InstanceRepository};
use slipway_orchestrator::build::complete_build;
use slipway_orchestrator::collaborators::{CollaboratorError, NotifyEvent};
use slipway_orchestrator::dedup::request_build;
use slipway_orchestrator::dock::{DOCK_REMOVED_MESSAGE, handle_dock_removed};

const NEW_DOCK: &str = "http://10.0.0.2:4242";

fn removed() -> DockRemoved {
    DockRemoved {
        host: DOCK.to_string(),
    }
}

#[tokio::test]
async fn test_live_containers_are_redeployed_elsewhere() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let running = h.seed_instance("api", &cv, Some(&build.id)).await;
    let running = h.give_container(&running, "c-running").await;
    let idle = h.seed_instance("api-idle", &cv, Some(&build.id)).await;
    h.docks.set_dock(NEW_DOCK).await;

    let removal = handle_dock_removed(&h.state, &removed()).await.unwrap();

    assert_eq!(removal.marked, 1);
    assert_eq!(removal.redeployed, vec![running.id.clone()]);
    assert!(removal.rebuilt.is_empty());

    let containers: Vec<CreateInstanceContainer> =
        h.payloads(queue::CREATE_INSTANCE_CONTAINER).await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].instance_id, running.id);
    assert_eq!(containers[0].context_version_id, cv.id);
    assert_eq!(containers[0].docker_host, NEW_DOCK);

    let old = h.instance(&running.id).await.container.unwrap();
    assert_eq!(old.container_id.as_deref(), Some("c-running"));
    assert_eq!(old.state, ContainerState::Dead);
    assert!(h.instance(&idle.id).await.container.is_none());
    assert!(h.notifier.events().await.contains(&NotifyEvent::InstanceUpdated {
        instance_id: running.id.clone(),
        action: "update".to_string(),
    }));

    // Delivered again: nothing left on the dock.
    let again = handle_dock_removed(&h.state, &removed()).await.unwrap();
    assert_eq!(again.marked, 0);
    assert!(again.redeployed.is_empty());
    assert_eq!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.len(), 1);
}

#[tokio::test]
async fn test_stopping_and_foreign_containers_are_not_redeployed() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let stopping = h.seed_instance("api", &cv, Some(&build.id)).await;
    let stopping = h.give_container(&stopping, "c-stopping").await;
    assert!(
        h.store
            .mark_container_stopping(&stopping.id, "c-stopping")
            .await
            .unwrap()
    );
    let running = h.seed_instance("api-2", &cv, Some(&build.id)).await;
    let running = h.give_container(&running, "c-running").await;

    let removal = handle_dock_removed(
        &h.state,
        &DockRemoved {
            host: NEW_DOCK.to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(removal.marked, 0);
    assert!(removal.redeployed.is_empty());
    assert_eq!(
        h.instance(&running.id).await.container.unwrap().state,
        ContainerState::Running
    );

    let removal = handle_dock_removed(&h.state, &removed()).await.unwrap();
    assert_eq!(removal.redeployed, vec![running.id.clone()]);
    assert_eq!(
        h.instance(&stopping.id).await.container.unwrap().state,
        ContainerState::Dead
    );
    let containers: Vec<CreateInstanceContainer> =
        h.payloads(queue::CREATE_INSTANCE_CONTAINER).await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].instance_id, running.id);
}

#[tokio::test]
async fn test_builds_in_flight_are_rebuilt_without_cache() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let outcome = request_build(
        &h.state,
        h.build_request(&context, vec![acv("acme/api", "main", "abc123")]),
    )
    .await
    .unwrap();
    let stranded = outcome.context_version.clone();
    assert_eq!(stranded.build.docker_host.as_deref(), Some(DOCK));
    let instance = h
        .seed_instance("api", &stranded, Some(&outcome.build.id))
        .await;
    h.docks.set_dock(NEW_DOCK).await;

    let removal = handle_dock_removed(&h.state, &removed()).await.unwrap();
    assert_eq!(removal.rebuilt, vec![instance.id.clone()]);
    assert!(removal.redeployed.is_empty());

    let rebuilds: Vec<InstanceRebuild> = h.payloads(queue::INSTANCE_REBUILD).await;
    assert_eq!(
        rebuilds,
        vec![InstanceRebuild {
            instance_id: instance.id.clone(),
        }]
    );

    let cv = h
        .store
        .get_context_version(&stranded.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cv.build.state(), BuildState::Failed);
    assert_eq!(cv.build.error.as_deref(), Some(DOCK_REMOVED_MESSAGE));
    let build = h.store.get_build(&outcome.build.id).await.unwrap().unwrap();
    assert!(build.completed);
    assert!(build.failed);
    assert!(h.notifier.events().await.contains(&NotifyEvent::BuildCompleted {
        context_version_id: stranded.id.clone(),
        failed: true,
    }));

    // The stranded builder job is skipped; the rebuild lands on the new dock.
    let worker = h.worker();
    worker.process_batch().await.unwrap();
    worker.process_batch().await.unwrap();
    assert!(
        h.jobs(queue::INSTANCE_REBUILD)
            .await
            .iter()
            .all(|job| job.status == JobStatus::Done.as_str())
    );
    let rebuilt = h.instance(&instance.id).await;
    assert_ne!(rebuilt.context_version.id, stranded.id);
    assert!(rebuilt.context_version.build.no_cache);
    assert_eq!(
        rebuilt.context_version.build.docker_host.as_deref(),
        Some(NEW_DOCK)
    );
    let builders = h.runtime.builders().await;
    assert_eq!(builders.len(), 1);
    assert_eq!(builders[0].docker_host, NEW_DOCK);

    // A late exit from the lost builder changes nothing.
    let late = complete_build(&h.state, &builder_died(&stranded, 0))
        .await
        .unwrap();
    assert!(late.context_versions.is_empty());
    assert!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.is_empty());
}

#[tokio::test]
async fn test_placement_failure_is_retried_on_redelivery() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let instance = h.seed_instance("api", &cv, Some(&build.id)).await;
    let instance = h.give_container(&instance, "c-1").await;

    // One delivery's worth of in-handler retries.
    h.docks
        .fail_next(3, CollaboratorError::Unavailable("placement down".into()))
        .await;
    let err = handle_dock_removed(&h.state, &removed()).await.unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
    assert!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.is_empty());
    assert!(h.instance(&instance.id).await.container.unwrap().is_alive());

    let removal = handle_dock_removed(&h.state, &removed()).await.unwrap();
    assert_eq!(removal.redeployed, vec![instance.id.clone()]);
    assert_eq!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.len(), 1);
}

#[tokio::test]
async fn test_worker_consumes_dock_removed() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let instance = h.seed_instance("api", &cv, Some(&build.id)).await;
    h.give_container(&instance, "c-1").await;

    h.state
        .publisher
        .publish(queue::DOCK_REMOVED, &removed())
        .await
        .unwrap();
    h.worker().process_batch().await.unwrap();

    let jobs = h.jobs(queue::DOCK_REMOVED).await;
    assert_eq!(jobs[0].status, JobStatus::Done.as_str());
    let containers: Vec<CreateInstanceContainer> =
        h.payloads(queue::CREATE_INSTANCE_CONTAINER).await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].instance_id, instance.id);
}
