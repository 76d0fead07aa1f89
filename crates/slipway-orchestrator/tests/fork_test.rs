// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch fork tests.

mod common;

use common::{Harness, acv};
use slipway_core::graph::BuildState;
use slipway_core::jobs::queue;
use slipway_orchestrator::Error;
use slipway_orchestrator::collaborators::NotifyEvent;
use slipway_orchestrator::fork::{
    AUTOFORK_MESSAGE, PushInfo, auto_fork, fork_instance, insert_with_free_short_hash,
};

fn push(repo: &str, branch: &str, commit: &str) -> PushInfo {
    PushInfo {
        repo: repo.to_string(),
        branch: branch.to_string(),
        commit: commit.to_string(),
        user_github_id: 77,
    }
}

#[tokio::test]
async fn test_fork_instance_for_new_branch() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let parent = h.seed_instance("api", &cv, Some(&build.id)).await;

    let fork = fork_instance(&h.state, &parent, &push("acme/api", "feature/login", "f1"))
        .await
        .unwrap();

    assert_eq!(fork.name, "feature-login-api");
    assert_eq!(fork.parent.as_deref(), Some(parent.short_hash.as_str()));
    assert!(fork.auto_forked);
    assert!(!fork.master_pod);
    assert!(!fork.locked);
    assert_eq!(fork.created_by, 77);
    assert_eq!(fork.env, parent.env);
    assert_ne!(fork.short_hash, parent.short_hash);

    let fork_cv = &fork.context_version;
    assert_ne!(fork_cv.id, cv.id);
    assert_eq!(fork_cv.build.state(), BuildState::Started);
    assert_eq!(fork_cv.build.message.as_deref(), Some(AUTOFORK_MESSAGE));
    let trigger = fork_cv.build.triggered_action.clone().unwrap();
    assert!(!trigger.manual);
    assert_eq!(trigger.app_code_version.unwrap().branch, "feature/login");
    assert_eq!(fork_cv.app_code_versions.len(), 1);
    assert_eq!(fork_cv.app_code_versions[0].branch, "feature/login");
    assert_eq!(fork_cv.app_code_versions[0].commit, "f1");

    // The build is still running, so nothing is deployed yet.
    assert!(h.jobs(queue::CREATE_INSTANCE_CONTAINER).await.is_empty());
    // One builder for the parent's build, one for the fork's.
    assert_eq!(h.jobs(queue::CREATE_IMAGE_BUILDER_CONTAINER).await.len(), 2);

    assert!(h.notifier.events().await.contains(&NotifyEvent::InstanceUpdated {
        instance_id: fork.id.clone(),
        action: "post".to_string(),
    }));

    // The parent keeps tracking its own branch.
    let parent = h.instance(&parent.id).await;
    assert_eq!(parent.context_version.id, cv.id);
}

#[tokio::test]
async fn test_auto_fork_keeps_one_entry_per_instance() {
    let h = Harness::new().await;
    let api_context = h.seed_context("api").await;
    let web_context = h.seed_context("web").await;
    let (api_cv, api_build) = h
        .completed_build(&api_context, vec![acv("acme/api", "main", "c1")])
        .await;
    let (web_cv, web_build) = h
        .completed_build(&web_context, vec![acv("acme/web", "main", "w1")])
        .await;
    let api = h.seed_instance("api", &api_cv, Some(&api_build.id)).await;
    let web = h.seed_instance("web", &web_cv, Some(&web_build.id)).await;

    let forks = auto_fork(&h.state, &[api, web], &push("acme/api", "hotfix", "h1")).await;

    assert_eq!(forks.len(), 2);
    assert_eq!(forks[0].as_ref().unwrap().name, "hotfix-api");
    assert!(forks[1].is_none());
}

#[tokio::test]
async fn test_forking_the_same_branch_twice_conflicts() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let parent = h.seed_instance("api", &cv, Some(&build.id)).await;
    let push = push("acme/api", "feature/login", "f1");

    fork_instance(&h.state, &parent, &push).await.unwrap();
    let err = fork_instance(&h.state, &parent, &push).await.unwrap_err();

    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    // The second request joined the first fork's build instead of starting another.
    assert_eq!(h.jobs(queue::CREATE_IMAGE_BUILDER_CONTAINER).await.len(), 2);
}

#[tokio::test]
async fn test_taken_short_hash_is_redrawn() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    let existing = h.seed_instance("api", &cv, Some(&build.id)).await;

    let mut colliding = Harness::new_instance("api-copy", &cv, Some(&build.id));
    colliding.short_hash = existing.short_hash.clone();
    let inserted = insert_with_free_short_hash(&h.state, colliding).await.unwrap();

    assert_ne!(inserted.short_hash, existing.short_hash);
    assert_eq!(inserted.short_hash.len(), existing.short_hash.len());
    let stored = h.instance(&inserted.id).await;
    assert_eq!(stored.short_hash, inserted.short_hash);
    assert_eq!(h.instance(&existing.id).await.short_hash, existing.short_hash);
}

#[tokio::test]
async fn test_duplicate_name_is_not_mistaken_for_hash_collision() {
    let h = Harness::new().await;
    let context = h.seed_context("api").await;
    let (cv, build) = h
        .completed_build(&context, vec![acv("acme/api", "main", "c1")])
        .await;
    h.seed_instance("api", &cv, Some(&build.id)).await;

    let duplicate = Harness::new_instance("API", &cv, Some(&build.id));
    let err = insert_with_free_short_hash(&h.state, duplicate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
}
