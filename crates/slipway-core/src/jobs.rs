// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job payload contracts and the durable job record.
//!
//! Inbound jobs describe container lifecycle events reported by the docks;
//! outbound jobs are requests published by the orchestrator. Payloads are
//! stored as JSON in the `jobs` table, one row per message.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue names.
pub mod queue {
    /// An image-builder container exited.
    pub const BUILD_CONTAINER_DIED: &str = "build.container.died";
    /// An application container exited (alias of `instance.container.died`).
    pub const APPLICATION_CONTAINER_DIED: &str = "application.container.died";
    /// An instance container exited.
    pub const INSTANCE_CONTAINER_DIED: &str = "instance.container.died";
    /// An instance container got its network attached.
    pub const CONTAINER_NETWORK_ATTACHED: &str = "container.network.attached";
    /// An instance was deployed; also where `instanceDeployed` is published.
    pub const INSTANCE_DEPLOYED: &str = "instance.deployed";
    /// Manual recovery rebuild of an instance.
    pub const INSTANCE_REBUILD: &str = "instance.rebuild";
    /// Create an instance container.
    pub const CREATE_INSTANCE_CONTAINER: &str = "createInstanceContainer";
    /// Create an image-builder container.
    pub const CREATE_IMAGE_BUILDER_CONTAINER: &str = "createImageBuilderContainer";
    /// Kill every member of an isolation.
    pub const KILL_ISOLATION: &str = "killIsolation";
    /// Release a finished build container's resources on its dock.
    pub const CLEAR_CONTAINER_MEMORY: &str = "clearContainerMemory";
    /// Push a built image to the registry.
    pub const PUSH_IMAGE: &str = "pushImage";
    /// A dock left the fleet.
    pub const DOCK_REMOVED: &str = "dock.removed";
}

/// Status of a durable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Handled successfully.
    Done,
    /// Dead-lettered.
    Failed,
}

impl JobStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Job row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Database primary key.
    pub id: i64,
    /// Queue name.
    pub queue: String,
    /// JSON payload.
    pub payload: String,
    /// pending, running, done or failed.
    pub status: String,
    /// Deliveries so far.
    pub attempts: i32,
    /// Deliveries allowed before dead-lettering.
    pub max_attempts: i32,
    /// Earliest time the job may be delivered.
    pub available_at: DateTime<Utc>,
    /// Error from the last failed delivery.
    pub last_error: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Parse the payload into a typed job.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// True once the delivery budget is spent.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// `Config` section of a docker inspect document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectConfig {
    /// Container labels. Values are usually strings; numbers are tolerated.
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, Value>,
}

/// `State` section of a docker inspect document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectState {
    /// Process exit code.
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

/// `NetworkSettings` section of a docker inspect document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectNetworkSettings {
    /// Port bindings.
    #[serde(rename = "Ports", default)]
    pub ports: Option<Value>,
}

/// The parts of a docker inspect document the orchestrator reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectData {
    /// Container configuration.
    #[serde(rename = "Config", default)]
    pub config: InspectConfig,
    /// Container state.
    #[serde(rename = "State", default)]
    pub state: Option<InspectState>,
    /// Network settings.
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: Option<InspectNetworkSettings>,
}

impl InspectData {
    /// Label value as a string. Numeric labels are rendered in decimal.
    pub fn label(&self, name: &str) -> Option<String> {
        match self.config.labels.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Label value parsed as an integer.
    pub fn label_i64(&self, name: &str) -> Option<i64> {
        match self.config.labels.get(name)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Exit code, if the state section is present.
    pub fn exit_code(&self) -> Option<i64> {
        self.state.as_ref().map(|s| s.exit_code)
    }
}

/// Label carrying the build sub-record id on image-builder containers.
pub const LABEL_BUILD_ID: &str = "contextVersion.build._id";
/// Label carrying the context version id.
pub const LABEL_CONTEXT_VERSION_ID: &str = "contextVersionId";
/// Label carrying the instance id on instance containers.
pub const LABEL_INSTANCE_ID: &str = "instanceId";
/// Label carrying the owner login.
pub const LABEL_OWNER_USERNAME: &str = "ownerUsername";
/// Label carrying the GitHub id of the acting user.
pub const LABEL_SESSION_USER_GITHUB_ID: &str = "sessionUserGithubId";
/// Label carrying the image tag a build produces.
pub const LABEL_DOCKER_TAG: &str = "dockerTag";

/// `build.container.died`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContainerDied {
    /// Container id.
    pub id: String,
    /// Docker host URL.
    pub host: String,
    /// Inspect document at exit.
    pub inspect_data: InspectData,
}

/// `instance.container.died` / `application.container.died`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceContainerDied {
    /// Container id.
    pub id: String,
    /// Docker host URL.
    #[serde(default)]
    pub host: Option<String>,
    /// Inspect document at exit.
    pub inspect_data: InspectData,
}

/// `container.network.attached`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNetworkAttached {
    /// Container id.
    pub id: String,
    /// Address assigned on the overlay network.
    pub container_ip: String,
    /// Docker host URL.
    #[serde(default)]
    pub host: Option<String>,
    /// Inspect document after attach.
    pub inspect_data: InspectData,
}

/// `instance.deployed`, published as `instanceDeployed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDeployed {
    /// Deployed instance.
    pub instance_id: String,
    /// Context version deployed to it.
    pub cv_id: String,
}

/// `instance.rebuild`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRebuild {
    /// Instance to rebuild.
    pub instance_id: String,
}

/// `dock.removed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockRemoved {
    /// Docker host URL of the removed dock.
    pub host: String,
}

/// `createInstanceContainer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceContainer {
    /// Context version whose image runs in the container.
    pub context_version_id: String,
    /// Target instance.
    pub instance_id: String,
    /// Dock to create the container on.
    pub docker_host: String,
    /// Environment, `KEY=value`.
    pub instance_envs: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// GitHub id of the acting user.
    pub session_user_id: i64,
}

/// `createImageBuilderContainer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageBuilderContainer {
    /// Build started by a person.
    pub manual_build: bool,
    /// GitHub id of the acting user.
    pub session_user_github_id: i64,
    /// Owner login.
    pub owner_username: String,
    /// Context being built.
    pub context_id: String,
    /// Context version being built.
    pub context_version_id: String,
    /// Dock to build on.
    pub docker_host: String,
    /// Skip the layer cache.
    pub no_cache: bool,
}

/// `killIsolation`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillIsolation {
    /// Isolation to kill.
    pub isolation_id: String,
    /// Redeploy the group once every member has died.
    pub trigger_redeploy: bool,
}

/// `clearContainerMemory`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearContainerMemory {
    /// Finished build container.
    pub container_id: String,
}

/// `pushImage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushImage {
    /// Dock holding the image.
    pub docker_host_url: String,
    /// Image tag to push.
    pub image_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_container_died_parses_docker_shape() {
        let payload = json!({
            "id": "c0ffee",
            "host": "http://10.0.0.1:4242",
            "inspectData": {
                "Config": {
                    "Labels": {
                        "contextVersion.build._id": "b-1",
                        "ownerUsername": "acme",
                        "sessionUserGithubId": 42
                    }
                },
                "State": { "ExitCode": 124 }
            }
        });

        let job: BuildContainerDied = serde_json::from_value(payload).unwrap();
        assert_eq!(job.inspect_data.label(LABEL_BUILD_ID).as_deref(), Some("b-1"));
        assert_eq!(
            job.inspect_data.label(LABEL_SESSION_USER_GITHUB_ID).as_deref(),
            Some("42")
        );
        assert_eq!(job.inspect_data.label_i64(LABEL_SESSION_USER_GITHUB_ID), Some(42));
        assert_eq!(job.inspect_data.label(LABEL_DOCKER_TAG), None);
        assert_eq!(job.inspect_data.exit_code(), Some(124));
    }

    #[test]
    fn test_missing_state_has_no_exit_code() {
        let job: InstanceContainerDied = serde_json::from_value(json!({
            "id": "c1",
            "inspectData": { "Config": { "Labels": {} } }
        }))
        .unwrap();
        assert_eq!(job.inspect_data.exit_code(), None);
        assert!(job.host.is_none());
    }

    #[test]
    fn test_outbound_payloads_use_camel_case() {
        let value = serde_json::to_value(KillIsolation {
            isolation_id: "iso-1".to_string(),
            trigger_redeploy: true,
        })
        .unwrap();
        assert_eq!(value, json!({ "isolationId": "iso-1", "triggerRedeploy": true }));

        let value = serde_json::to_value(PushImage {
            docker_host_url: "http://10.0.0.1:4242".to_string(),
            image_tag: "registry/acme/cv:b".to_string(),
        })
        .unwrap();
        assert!(value.get("dockerHostUrl").is_some());
        assert!(value.get("imageTag").is_some());
    }
}
