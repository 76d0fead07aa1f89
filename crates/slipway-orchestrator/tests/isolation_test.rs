// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isolation group tests: master death, kill and redeploy, isolate.

mod common;

use common::{Harness, USER_GITHUB_ID, acv, instance_died};
use slipway_core::graph::{BuildState, ContainerState, IsolationState};
use slipway_core::jobs::{CreateInstanceContainer, KillIsolation, queue};
use slipway_core::persistence::InstanceRepository;
use slipway_orchestrator::Error;
use slipway_orchestrator::collaborators::{CollaboratorError, NotifyEvent};
use slipway_orchestrator::deploy::{DeployRequest, FanOutOutcome, fan_out_build};
use slipway_orchestrator::fork::PushInfo;
use slipway_orchestrator::isolation::{
    IsolateRequest, RepoChild, handle_instance_died, isolate, kill_isolation,
};

#[tokio::test]
async fn test_master_death_kills_redeploying_isolation() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let master = h.give_container(&master, "c-master").await;
    let isolation = h.seed_isolation(&master, true).await;

    handle_instance_died(&h.state, &instance_died(&master.id, "c-master", 137))
        .await
        .unwrap();

    let kills: Vec<KillIsolation> = h.payloads(queue::KILL_ISOLATION).await;
    assert_eq!(
        kills,
        vec![KillIsolation {
            isolation_id: isolation.id.clone(),
            trigger_redeploy: true,
        }]
    );

    let container = h.instance(&master.id).await.container.unwrap();
    assert_eq!(container.state, ContainerState::Dead);
    assert_eq!(container.exit_code, Some(137));

    // The same exit reported again is ignored.
    handle_instance_died(&h.state, &instance_died(&master.id, "c-master", 137))
        .await
        .unwrap();
    assert_eq!(h.jobs(queue::KILL_ISOLATION).await.len(), 1);
}

#[tokio::test]
async fn test_master_death_without_redeploy_leaves_isolation_alone() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let master = h.give_container(&master, "c-master").await;
    let isolation = h.seed_isolation(&master, false).await;

    handle_instance_died(&h.state, &instance_died(&master.id, "c-master", 1))
        .await
        .unwrap();

    assert!(h.jobs(queue::KILL_ISOLATION).await.is_empty());
    assert_eq!(h.isolation(&isolation.id).await.state, IsolationState::Created);
}

#[tokio::test]
async fn test_deploy_excludes_isolated_master_and_kills_group() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let plain = h.seed_instance("api-2", &cv, Some(&build.id)).await;
    let isolation = h.seed_isolation(&master, true).await;

    let outcome = fan_out_build(
        &h.state,
        &DeployRequest {
            build_id: build.id.clone(),
            instance_id: None,
            force_dock: None,
            session_user_github_id: USER_GITHUB_ID,
            owner_username: "acme".to_string(),
        },
    )
    .await
    .unwrap();

    let FanOutOutcome::Deployed(deployed) = outcome else {
        panic!("expected a deploy");
    };
    let deployed_ids: Vec<_> = deployed.iter().map(|i| i.id.clone()).collect();
    assert_eq!(deployed_ids, vec![plain.id.clone()]);

    let containers: Vec<CreateInstanceContainer> =
        h.payloads(queue::CREATE_INSTANCE_CONTAINER).await;
    assert!(containers.iter().all(|job| job.instance_id != master.id));

    let kills: Vec<KillIsolation> = h.payloads(queue::KILL_ISOLATION).await;
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].isolation_id, isolation.id);
    assert!(kills[0].trigger_redeploy);
}

#[tokio::test]
async fn test_kill_then_redeploy_cycle() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let master = h.give_container(&master, "c-master").await;
    let child = h.seed_instance("db", &cv, Some(&build.id)).await;
    let child = h.give_container(&child, "c-child").await;
    let isolation = h.seed_isolation(&master, true).await;
    h.store
        .set_instance_isolation(&child.id, Some(&isolation.id), false)
        .await
        .unwrap();

    kill_isolation(
        &h.state,
        &KillIsolation {
            isolation_id: isolation.id.clone(),
            trigger_redeploy: true,
        },
    )
    .await
    .unwrap();

    let killing = h.isolation(&isolation.id).await;
    assert_eq!(killing.state, IsolationState::Killing);
    assert!(killing.redeploy_pending);
    assert_eq!(h.runtime.kills().await.len(), 2);
    assert_eq!(
        h.instance(&child.id).await.container.unwrap().state,
        ContainerState::Stopping
    );

    // First member dies: still waiting for the master.
    handle_instance_died(&h.state, &instance_died(&child.id, "c-child", 137))
        .await
        .unwrap();
    assert_eq!(h.isolation(&isolation.id).await.state, IsolationState::Killing);
    assert!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.is_empty());

    // Last member dies: killed, then redeployed.
    handle_instance_died(&h.state, &instance_died(&master.id, "c-master", 137))
        .await
        .unwrap();

    let redeployed = h.isolation(&isolation.id).await;
    assert_eq!(redeployed.state, IsolationState::Created);
    assert!(!redeployed.redeploy_pending);

    let mut targets: Vec<String> = h
        .payloads::<CreateInstanceContainer>(queue::CREATE_INSTANCE_CONTAINER)
        .await
        .into_iter()
        .map(|job| job.instance_id)
        .collect();
    targets.sort();
    let mut expected = vec![master.id.clone(), child.id.clone()];
    expected.sort();
    assert_eq!(targets, expected);

    // The expected deaths never triggered another kill.
    assert!(h.jobs(queue::KILL_ISOLATION).await.is_empty());

    let redeploy_events = h
        .notifier
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, NotifyEvent::InstanceUpdated { action, .. } if action == "redeploy"))
        .count();
    assert_eq!(redeploy_events, 2);
}

#[tokio::test]
async fn test_kill_without_live_members_finishes_immediately() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let isolation = h.seed_isolation(&master, true).await;

    kill_isolation(
        &h.state,
        &KillIsolation {
            isolation_id: isolation.id.clone(),
            trigger_redeploy: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(h.isolation(&isolation.id).await.state, IsolationState::Killed);
    assert!(h.runtime.kills().await.is_empty());
    assert!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.is_empty());
}

#[tokio::test]
async fn test_kill_failure_is_retryable() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    let master = h.give_container(&master, "c-master").await;
    let isolation = h.seed_isolation(&master, true).await;
    h.runtime
        .fail_kills(3, CollaboratorError::Unavailable("dock down".into()))
        .await;

    let err = kill_isolation(
        &h.state,
        &KillIsolation {
            isolation_id: isolation.id.clone(),
            trigger_redeploy: true,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::TransientInfrastructure(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_isolate_forks_children_into_group() {
    let h = Harness::new().await;
    let api = h.seed_context("api").await;
    let db = h.seed_context("db").await;
    let (api_cv, api_build) = h
        .completed_build(&api, vec![acv("acme/api", "main", "c1")])
        .await;
    let (db_cv, db_build) = h
        .completed_build(&db, vec![acv("acme/db-config", "main", "d1")])
        .await;
    let web_context = h.seed_context("web").await;
    let (web_cv, web_build) = h
        .completed_build(&web_context, vec![acv("acme/web", "main", "w1")])
        .await;

    let master = h.seed_instance("api", &api_cv, Some(&api_build.id)).await;
    let database = h.seed_instance("db", &db_cv, Some(&db_build.id)).await;
    let web = h.seed_instance("web", &web_cv, Some(&web_build.id)).await;

    let (isolation, children) = isolate(
        &h.state,
        &IsolateRequest {
            master_instance_id: master.id.clone(),
            child_instance_ids: vec![database.id.clone()],
            repo_children: vec![RepoChild {
                instance_id: web.id.clone(),
                push: PushInfo {
                    repo: "acme/web".to_string(),
                    branch: "feature-x".to_string(),
                    commit: "w2".to_string(),
                    user_github_id: USER_GITHUB_ID,
                },
            }],
            redeploy_on_killed: true,
            session_user_github_id: USER_GITHUB_ID,
        },
    )
    .await
    .unwrap();

    assert_eq!(isolation.state, IsolationState::Created);
    assert!(isolation.redeploy_on_killed);
    let master = h.instance(&master.id).await;
    assert_eq!(master.isolated.as_deref(), Some(isolation.id.as_str()));
    assert!(master.is_isolation_group_master);

    assert_eq!(children.len(), 2);
    let (db_fork, web_fork) = (&children[0], &children[1]);
    for fork in [db_fork, web_fork] {
        assert_eq!(fork.isolated.as_deref(), Some(isolation.id.as_str()));
        assert!(!fork.is_isolation_group_master);
        assert!(fork.auto_forked);
        assert!(!fork.master_pod);
    }
    assert_eq!(db_fork.name, format!("{}--db", master.short_hash));
    assert_eq!(web_fork.name, format!("{}--web", master.short_hash));

    // The non-repository copy reused the parent's completed build and deployed at once.
    assert_eq!(db_fork.context_version.id, db_cv.id);
    let containers: Vec<CreateInstanceContainer> =
        h.payloads(queue::CREATE_INSTANCE_CONTAINER).await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].instance_id, db_fork.id);
    assert_eq!(
        containers[0].labels.get("isolationId"),
        Some(&isolation.id)
    );

    // The repository fork builds the pushed commit.
    assert_eq!(web_fork.context_version.build.state(), BuildState::Started);
    assert_eq!(web_fork.context_version.app_code_versions[0].commit, "w2");
    assert_ne!(web_fork.context_version.id, web_cv.id);
}

#[tokio::test]
async fn test_isolating_an_isolated_instance_is_incorrect_state() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let master = h.seed_instance("api", &cv, Some(&build.id)).await;
    h.seed_isolation(&master, false).await;

    let err = isolate(
        &h.state,
        &IsolateRequest {
            master_instance_id: master.id.clone(),
            child_instance_ids: vec![],
            repo_children: vec![],
            redeploy_on_killed: false,
            session_user_github_id: USER_GITHUB_ID,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)));
}
