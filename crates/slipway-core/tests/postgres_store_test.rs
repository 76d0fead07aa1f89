// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests. Require TEST_SLIPWAY_DATABASE_URL.

use std::sync::Arc;

use chrono::{Duration, Utc};
use slipway_core::graph::{
    AppCodeVersion, BuildRecord, ContainerInfo, ContainerState, Context, ContextVersion,
    InfraCodeVersion, Instance, Isolation, IsolationState, NetworkInfo, Owner, TriggeredAction,
    new_id, new_short_hash,
};
use slipway_core::persistence::{
    BuildStart, ContextRepository, ContextVersionRepository, InstanceRepository,
    IsolationRepository, JobQueue, PostgresStore,
};
use uuid::Uuid;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_SLIPWAY_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_SLIPWAY_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_test_store() -> Option<PostgresStore> {
    let database_url = std::env::var("TEST_SLIPWAY_DATABASE_URL").ok()?;
    PostgresStore::connect(&database_url, 5).await.ok()
}

/// A fresh owner per test so runs against a shared database do not collide.
fn unique_owner() -> Owner {
    let github_id = (Uuid::new_v4().as_u128() % 1_000_000_000) as i64 + 1;
    Owner {
        github_id,
        username: format!("org-{}", github_id),
    }
}

async fn seed_context(store: &PostgresStore, owner: &Owner) -> Context {
    let context = Context {
        id: new_id(),
        owner: owner.clone(),
        name: "api".to_string(),
        is_source: false,
        created_at: Utc::now(),
    };
    store.insert_context(&context).await.unwrap();
    context
}

fn version(context: &Context, branch: &str) -> ContextVersion {
    ContextVersion {
        id: new_id(),
        context_id: context.id.clone(),
        owner: context.owner.clone(),
        created_by: 42,
        app_code_versions: vec![AppCodeVersion {
            repo: "acme/api".to_string(),
            branch: branch.to_string(),
            commit: "abc123".to_string(),
            use_latest: false,
        }],
        infra_code_version: InfraCodeVersion {
            id: "icv-1".to_string(),
            hash: "infra".to_string(),
        },
        advanced: false,
        build: BuildRecord::unstarted(),
        created_at: Utc::now(),
    }
}

fn instance(owner: &Owner, name: &str, cv: &ContextVersion) -> Instance {
    Instance {
        id: new_id(),
        name: name.to_string(),
        short_hash: new_short_hash(),
        owner: owner.clone(),
        created_by: 42,
        parent: None,
        build_id: None,
        context_version: cv.clone(),
        env: Vec::new(),
        network: NetworkInfo::default(),
        container: None,
        isolated: None,
        is_isolation_group_master: false,
        locked: false,
        master_pod: true,
        auto_forked: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        return;
    };
    let store = Arc::new(store);
    let owner = unique_owner();
    let key = format!("key-{}", new_id());
    let now = Utc::now();
    let stale = now - Duration::minutes(30);

    let owner_id = owner.github_id;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .claim_build(owner_id, &key, &format!("cv-{}", i), "dock-a", now, stale)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        winners.push(handle.await.unwrap().context_version_id);
    }
    winners.dedup();
    assert_eq!(winners.len(), 1, "all claimants must agree on one holder");
}

#[tokio::test]
async fn test_build_completion_is_exactly_once() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        return;
    };
    let owner = unique_owner();
    let context = seed_context(&store, &owner).await;
    let cv = version(&context, "main");
    store.insert_context_version(&cv).await.unwrap();
    let start = BuildStart {
        started_at: Utc::now(),
        docker_host: "dock-a".to_string(),
        docker_tag: "registry.test/tag".to_string(),
        triggered_action: TriggeredAction::default(),
        message: None,
        no_cache: false,
    };
    assert!(store.mark_build_started(&cv.id, &start).await.unwrap());

    let store = Arc::new(store);
    let (a, b) = tokio::join!(
        store.complete_build(&cv.build.id, Utc::now()),
        store.fail_build(&cv.build.id, Utc::now(), "Building the image failed")
    );
    let moved = a.unwrap().len() + b.unwrap().len();
    assert_eq!(moved, 1);
}

#[tokio::test]
async fn test_instance_conflicts_and_container_guards() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        return;
    };
    let owner = unique_owner();
    let context = seed_context(&store, &owner).await;
    let cv = version(&context, "Main");
    let inst = instance(&owner, "api", &cv);
    store.insert_instance(&inst).await.unwrap();

    let err = store
        .insert_instance(&instance(&owner, "API", &cv))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    let tracking = store
        .find_instances_tracking_branch(&context.id, "acme/API", "main")
        .await
        .unwrap();
    assert_eq!(tracking.len(), 1);

    let container = ContainerInfo {
        docker_host: "http://10.0.0.1:4242".to_string(),
        container_id: Some("c1".to_string()),
        context_version_id: cv.id.clone(),
        state: ContainerState::Starting,
        exit_code: None,
        error: None,
        ports: None,
    };
    assert!(
        store
            .set_instance_container(&inst.id, &cv.id, &container)
            .await
            .unwrap()
    );
    assert!(
        store
            .mark_container_died(&inst.id, "other", Some(1))
            .await
            .unwrap()
            .is_none()
    );
    let died = store
        .mark_container_died(&inst.id, "c1", Some(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(died.container.unwrap().state, ContainerState::Dead);
}

#[tokio::test]
async fn test_isolation_transitions() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        return;
    };
    let owner = unique_owner();
    let isolation = Isolation {
        id: new_id(),
        owner,
        created_by: 42,
        state: IsolationState::Created,
        redeploy_on_killed: false,
        redeploy_pending: false,
        created_at: Utc::now(),
    };
    store.insert_isolation(&isolation).await.unwrap();

    assert!(
        store
            .transition_isolation(
                &isolation.id,
                &[IsolationState::Created],
                IsolationState::Killing,
                None
            )
            .await
            .unwrap()
    );
    assert!(
        !store
            .transition_isolation(
                &isolation.id,
                &[IsolationState::Created],
                IsolationState::Killing,
                None
            )
            .await
            .unwrap()
    );
    assert!(
        store
            .find_redeploying_isolation(&isolation.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_job_claims_do_not_overlap() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        return;
    };
    let queue = format!("test.{}", new_id());
    for i in 0..10 {
        store
            .enqueue_job(&queue, &serde_json::json!({ "n": i }), 3)
            .await
            .unwrap();
    }

    let store = Arc::new(store);
    let now = Utc::now() + Duration::seconds(1);
    let queues = [queue.as_str()];
    let (a, b) = tokio::join!(
        store.claim_due_jobs(&queues, 10, now),
        store.claim_due_jobs(&queues, 10, now)
    );
    let mut ids: Vec<i64> = a.unwrap().into_iter().chain(b.unwrap()).map(|j| j.id).collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert_eq!(total, 10);
}
