// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for slipway-orchestrator integration tests.
//!
//! Provides a [`Harness`] wiring an in-memory SQLite store to mock
//! collaborators, plus seed helpers for the resource graph.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use slipway_core::SqliteStore;
use slipway_core::graph::{
    AppCodeVersion, Build, Context, ContainerInfo, ContainerState, ContextVersion,
    InfraCodeVersion, Instance, Isolation, IsolationState, NetworkInfo, Owner, TriggeredAction,
    new_id, new_short_hash,
};
use slipway_core::jobs::{
    BuildContainerDied, InspectConfig, InspectData, InspectState, InstanceContainerDied,
    JobRecord, LABEL_BUILD_ID, LABEL_INSTANCE_ID, LABEL_OWNER_USERNAME,
    LABEL_SESSION_USER_GITHUB_ID,
};
use slipway_core::persistence::{
    BuildRepository, ContextRepository, InstanceRepository, IsolationRepository, JobQueue,
};
use sqlx::sqlite::SqlitePoolOptions;

use slipway_orchestrator::build::complete_build;
use slipway_orchestrator::collaborators::{MockContainerRuntime, MockDockFinder, RecordingNotifier};
use slipway_orchestrator::dedup::{BuildOutcome, BuildRequest, request_build};
use slipway_orchestrator::retry::RetryPolicy;
use slipway_orchestrator::state::{OrchestratorState, Settings};
use slipway_orchestrator::worker::{JobWorker, JobWorkerConfig};

pub const DOCK: &str = "http://10.0.0.1:4242";
pub const OWNER_GITHUB_ID: i64 = 1001;
pub const OWNER_USERNAME: &str = "acme";
pub const USER_GITHUB_ID: i64 = 42;
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Orchestrator state over an in-memory store and recording collaborators.
pub struct Harness {
    pub state: OrchestratorState,
    pub store: Arc<SqliteStore>,
    pub docks: MockDockFinder,
    pub runtime: MockContainerRuntime,
    pub notifier: RecordingNotifier,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory SQLite");
        slipway_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let store = Arc::new(SqliteStore::new(pool));
        let docks = MockDockFinder::new(DOCK);
        let runtime = MockContainerRuntime::new();
        let notifier = RecordingNotifier::new();
        let settings = Settings {
            container_retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..Settings::default()
        };

        let state = OrchestratorState::new(
            store.clone(),
            Arc::new(docks.clone()),
            Arc::new(runtime.clone()),
            Arc::new(notifier.clone()),
            settings,
            JOB_MAX_ATTEMPTS,
        );

        Self {
            state,
            store,
            docks,
            runtime,
            notifier,
        }
    }

    pub fn owner() -> Owner {
        Owner {
            github_id: OWNER_GITHUB_ID,
            username: OWNER_USERNAME.to_string(),
        }
    }

    pub async fn seed_context(&self, name: &str) -> Context {
        let context = Context {
            id: new_id(),
            owner: Self::owner(),
            name: name.to_string(),
            is_source: false,
            created_at: Utc::now(),
        };
        self.store
            .insert_context(&context)
            .await
            .expect("Failed to insert context");
        context
    }

    pub fn build_request(&self, context: &Context, acvs: Vec<AppCodeVersion>) -> BuildRequest {
        BuildRequest {
            context_id: context.id.clone(),
            app_code_versions: acvs,
            infra_code_version: infra(),
            advanced: false,
            created_by: USER_GITHUB_ID,
            docker_host: None,
            no_cache: false,
            triggered_action: TriggeredAction {
                manual: true,
                app_code_version: None,
                rebuild: false,
            },
            message: None,
        }
    }

    /// Request a build and finish it with exit code 0.
    pub async fn completed_build(
        &self,
        context: &Context,
        acvs: Vec<AppCodeVersion>,
    ) -> (ContextVersion, Build) {
        let outcome: BuildOutcome = request_build(&self.state, self.build_request(context, acvs))
            .await
            .expect("Failed to request build");
        let completion = complete_build(&self.state, &builder_died(&outcome.context_version, 0))
            .await
            .expect("Failed to complete build");
        let cv = completion
            .context_versions
            .into_iter()
            .next()
            .expect("Build did not complete");
        let build = self
            .store
            .get_build(&outcome.build.id)
            .await
            .expect("Failed to read build")
            .expect("Build missing");
        (cv, build)
    }

    /// An unsaved master-pod instance using `cv`.
    pub fn new_instance(name: &str, cv: &ContextVersion, build_id: Option<&str>) -> Instance {
        Instance {
            id: new_id(),
            name: name.to_string(),
            short_hash: new_short_hash(),
            owner: Self::owner(),
            created_by: USER_GITHUB_ID,
            parent: None,
            build_id: build_id.map(str::to_string),
            context_version: cv.clone(),
            env: vec!["NODE_ENV=production".to_string()],
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

    pub async fn insert_instance(&self, instance: Instance) -> Instance {
        self.store
            .insert_instance(&instance)
            .await
            .expect("Failed to insert instance");
        instance
    }

    pub async fn seed_instance(
        &self,
        name: &str,
        cv: &ContextVersion,
        build_id: Option<&str>,
    ) -> Instance {
        self.insert_instance(Self::new_instance(name, cv, build_id))
            .await
    }

    pub async fn seed_locked_instance(
        &self,
        name: &str,
        cv: &ContextVersion,
        build_id: Option<&str>,
    ) -> Instance {
        let mut instance = Self::new_instance(name, cv, build_id);
        instance.locked = true;
        self.insert_instance(instance).await
    }

    /// Give an instance a running container. Returns the refreshed instance.
    pub async fn give_container(&self, instance: &Instance, container_id: &str) -> Instance {
        let container = ContainerInfo {
            docker_host: DOCK.to_string(),
            container_id: Some(container_id.to_string()),
            context_version_id: instance.context_version.id.clone(),
            state: ContainerState::Running,
            exit_code: None,
            error: None,
            ports: None,
        };
        assert!(
            self.store
                .set_instance_container(&instance.id, &instance.context_version.id, &container)
                .await
                .expect("Failed to set container")
        );
        self.instance(&instance.id).await
    }

    pub async fn seed_isolation(&self, master: &Instance, redeploy_on_killed: bool) -> Isolation {
        let isolation = Isolation {
            id: new_id(),
            owner: Self::owner(),
            created_by: USER_GITHUB_ID,
            state: IsolationState::Created,
            redeploy_on_killed,
            redeploy_pending: false,
            created_at: Utc::now(),
        };
        self.store
            .insert_isolation(&isolation)
            .await
            .expect("Failed to insert isolation");
        assert!(
            self.store
                .set_instance_isolation(&master.id, Some(&isolation.id), true)
                .await
                .expect("Failed to set master")
        );
        isolation
    }

    pub async fn instance(&self, id: &str) -> Instance {
        self.store
            .get_instance(id)
            .await
            .expect("Failed to read instance")
            .expect("Instance missing")
    }

    pub async fn isolation(&self, id: &str) -> Isolation {
        self.store
            .get_isolation(id)
            .await
            .expect("Failed to read isolation")
            .expect("Isolation missing")
    }

    pub async fn jobs(&self, queue: &str) -> Vec<JobRecord> {
        self.store
            .list_jobs(queue, None)
            .await
            .expect("Failed to list jobs")
    }

    pub async fn payloads<T: DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.jobs(queue)
            .await
            .iter()
            .map(|job| job.decode().expect("Malformed job payload"))
            .collect()
    }

    pub fn worker(&self) -> JobWorker {
        JobWorker::new(
            self.state.clone(),
            JobWorkerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
                retry_delay: Duration::ZERO,
            },
        )
    }
}

pub fn infra() -> InfraCodeVersion {
    InfraCodeVersion {
        id: "icv-1".to_string(),
        hash: "infra-hash-1".to_string(),
    }
}

pub fn acv(repo: &str, branch: &str, commit: &str) -> AppCodeVersion {
    AppCodeVersion {
        repo: repo.to_string(),
        branch: branch.to_string(),
        commit: commit.to_string(),
        use_latest: false,
    }
}

fn labels(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// `build.container.died` for a started context version.
pub fn builder_died(cv: &ContextVersion, exit_code: i64) -> BuildContainerDied {
    BuildContainerDied {
        id: format!("builder-{}", cv.id),
        host: DOCK.to_string(),
        inspect_data: InspectData {
            config: InspectConfig {
                labels: labels(&[
                    (LABEL_BUILD_ID, json!(cv.build.id)),
                    (LABEL_OWNER_USERNAME, json!(OWNER_USERNAME)),
                    (LABEL_SESSION_USER_GITHUB_ID, json!(USER_GITHUB_ID)),
                ]),
            },
            state: Some(InspectState { exit_code }),
            network_settings: None,
        },
    }
}

/// `instance.container.died` for an instance's container.
pub fn instance_died(instance_id: &str, container_id: &str, exit_code: i64) -> InstanceContainerDied {
    InstanceContainerDied {
        id: container_id.to_string(),
        host: Some(DOCK.to_string()),
        inspect_data: InspectData {
            config: InspectConfig {
                labels: labels(&[(LABEL_INSTANCE_ID, json!(instance_id))]),
            },
            state: Some(InspectState { exit_code }),
            network_settings: None,
        },
    }
}
