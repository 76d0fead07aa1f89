// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource graph records.
//!
//! These are the typed records held by the store: [`Context`], [`ContextVersion`],
//! [`Build`], [`Instance`], [`Isolation`] and [`User`]. They carry no behaviour
//! beyond small derived views (build state, content key); all mutation goes
//! through the repositories in [`crate::persistence`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a new record id.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a short hash for an instance (6 lowercase hex characters).
pub fn new_short_hash() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Owning organisation or user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// GitHub account id of the owner.
    pub github_id: i64,
    /// Owner login, used in container labels.
    pub username: String,
}

/// A user known to the platform, keyed by GitHub id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// GitHub account id.
    pub github_id: i64,
    /// GitHub login.
    pub username: String,
    /// Contact email, if known.
    pub email: Option<String>,
}

/// A named container-build template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Record id.
    pub id: String,
    /// Owning organisation or user.
    pub owner: Owner,
    /// Template name.
    pub name: String,
    /// True for shared source templates.
    pub is_source: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One repository checkout that goes into a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCodeVersion {
    /// Full repository name, `org/repo`.
    pub repo: String,
    /// Branch name as pushed.
    pub branch: String,
    /// Commit sha.
    pub commit: String,
    /// Track the latest commit of the branch instead of pinning `commit`.
    #[serde(default)]
    pub use_latest: bool,
}

impl AppCodeVersion {
    /// True when this checkout tracks the given repository and branch (case-insensitive).
    pub fn tracks(&self, repo: &str, branch: &str) -> bool {
        self.repo.eq_ignore_ascii_case(repo) && self.branch.eq_ignore_ascii_case(branch)
    }
}

/// Reference to the Dockerfile and support files used for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraCodeVersion {
    /// Infra code version id.
    pub id: String,
    /// Content hash of the Dockerfile and support files.
    pub hash: String,
}

/// What caused a build to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredAction {
    /// Started by a person rather than a push hook.
    pub manual: bool,
    /// The pushed checkout, for hook-triggered builds.
    #[serde(default)]
    pub app_code_version: Option<AppCodeVersion>,
    /// Rebuild of an existing instance.
    #[serde(default)]
    pub rebuild: bool,
}

/// Lifecycle of a context version build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Nothing has been started yet.
    Unstarted,
    /// Started and waiting for the build container to exit.
    Started,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl BuildState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The `build` sub-record of a context version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Build id carried on the image-builder container labels.
    pub id: String,
    /// When the build was started.
    pub started: Option<DateTime<Utc>>,
    /// When the build finished (successfully or not).
    pub completed: Option<DateTime<Utc>>,
    /// Build finished unsuccessfully.
    pub failed: bool,
    /// Human readable failure message.
    pub error: Option<String>,
    /// Free-form trigger message (`autodeploy`, `autofork`, `manual`, ...).
    pub message: Option<String>,
    /// What caused the build.
    pub triggered_action: Option<TriggeredAction>,
    /// Docker host running the build.
    pub docker_host: Option<String>,
    /// Image-builder container id, once created.
    pub docker_container: Option<String>,
    /// Tag of the image the build produces.
    pub docker_tag: Option<String>,
    /// Build skipped the docker layer cache.
    pub no_cache: bool,
}

impl BuildRecord {
    /// A fresh, unstarted build sub-record.
    pub fn unstarted() -> Self {
        Self {
            id: new_id(),
            started: None,
            completed: None,
            failed: false,
            error: None,
            message: None,
            triggered_action: None,
            docker_host: None,
            docker_container: None,
            docker_tag: None,
            no_cache: false,
        }
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> BuildState {
        if self.failed {
            BuildState::Failed
        } else if self.completed.is_some() {
            BuildState::Completed
        } else if self.started.is_some() {
            BuildState::Started
        } else {
            BuildState::Unstarted
        }
    }
}

/// One buildable snapshot of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextVersion {
    /// Record id.
    pub id: String,
    /// Owning context.
    pub context_id: String,
    /// Owner copied from the context.
    pub owner: Owner,
    /// GitHub id of the user that created this version.
    pub created_by: i64,
    /// Repository checkouts, in declaration order.
    pub app_code_versions: Vec<AppCodeVersion>,
    /// Dockerfile reference.
    pub infra_code_version: InfraCodeVersion,
    /// Non-repository (manually configured) version.
    pub advanced: bool,
    /// Build sub-record.
    pub build: BuildRecord,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ContextVersion {
    /// Dedup key for this version's sources.
    pub fn content_key(&self) -> String {
        content_key(&self.app_code_versions, &self.infra_code_version.hash)
    }

    /// First checkout that tracks the given repository and branch.
    pub fn app_code_version_for(&self, repo: &str, branch: &str) -> Option<&AppCodeVersion> {
        self.app_code_versions.iter().find(|acv| acv.tracks(repo, branch))
    }
}

/// Compute the dedup content key of a set of checkouts and an infra hash.
///
/// Checkouts are reduced to lower-cased `repo|branch|commit` lines, sorted, and
/// hashed together with the infra hash, so declaration order and letter case
/// do not produce distinct keys.
pub fn content_key(app_code_versions: &[AppCodeVersion], infra_hash: &str) -> String {
    let mut lines: Vec<String> = app_code_versions
        .iter()
        .map(|acv| {
            format!(
                "{}|{}|{}",
                acv.repo.to_lowercase(),
                acv.branch.to_lowercase(),
                acv.commit.to_lowercase()
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"infra:");
    hasher.update(infra_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A group of context versions built together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Record id.
    pub id: String,
    /// Owner.
    pub owner: Owner,
    /// GitHub id of the user that requested the build.
    pub created_by: i64,
    /// Member context versions.
    pub context_version_ids: Vec<String>,
    /// All members finished.
    pub completed: bool,
    /// At least one member failed.
    pub failed: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// State of an instance container as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Created, network not attached yet.
    Starting,
    /// Network attached.
    Running,
    /// A kill has been requested.
    Stopping,
    /// Exited.
    Dead,
}

/// Container descriptor stored on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Docker host running the container.
    pub docker_host: String,
    /// Container id, absent when creation failed.
    pub container_id: Option<String>,
    /// Context version the container was created from.
    pub context_version_id: String,
    /// Last observed state.
    pub state: ContainerState,
    /// Exit code once dead.
    pub exit_code: Option<i64>,
    /// Creation error, if creation failed.
    pub error: Option<String>,
    /// Exposed ports as reported by the runtime.
    #[serde(default)]
    pub ports: Option<serde_json::Value>,
}

impl ContainerInfo {
    /// A container that exists and has not died yet.
    pub fn is_alive(&self) -> bool {
        self.container_id.is_some() && self.state != ContainerState::Dead
    }
}

/// Network addresses of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Docker host address.
    pub host_ip: Option<String>,
    /// Container address on the overlay network.
    pub network_ip: Option<String>,
}

/// A deployment unit backed by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Record id.
    pub id: String,
    /// Display name, unique per owner.
    pub name: String,
    /// Short hash, unique per owner.
    pub short_hash: String,
    /// Owner.
    pub owner: Owner,
    /// GitHub id of the creator.
    pub created_by: i64,
    /// Short hash of the instance this one was forked from.
    pub parent: Option<String>,
    /// Build currently deployed (or being deployed).
    pub build_id: Option<String>,
    /// Point-in-time copy of the context version in use.
    pub context_version: ContextVersion,
    /// Environment variables, `KEY=value`.
    pub env: Vec<String>,
    /// Network addresses.
    pub network: NetworkInfo,
    /// Current container, if any.
    pub container: Option<ContainerInfo>,
    /// Isolation this instance belongs to.
    pub isolated: Option<String>,
    /// Master of its isolation group.
    pub is_isolation_group_master: bool,
    /// Excluded from blanket deploys.
    pub locked: bool,
    /// Master pod of a repository (not a fork).
    pub master_pod: bool,
    /// Created by the auto-fork flow.
    pub auto_forked: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an isolation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationState {
    /// Running normally.
    Created,
    /// Kill issued, waiting for members to die.
    Killing,
    /// Every member has died.
    Killed,
    /// Members are being recreated.
    Redeploying,
}

impl IsolationState {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Redeploying => "redeploying",
        }
    }
}

impl std::str::FromStr for IsolationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "killing" => Ok(Self::Killing),
            "killed" => Ok(Self::Killed),
            "redeploying" => Ok(Self::Redeploying),
            other => Err(format!("unknown isolation state '{}'", other)),
        }
    }
}

impl std::fmt::Display for IsolationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group of instances killed and redeployed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Isolation {
    /// Record id.
    pub id: String,
    /// Owner.
    pub owner: Owner,
    /// GitHub id of the creator.
    pub created_by: i64,
    /// Current state.
    pub state: IsolationState,
    /// Kill the group when its master container dies.
    pub redeploy_on_killed: bool,
    /// The kill in progress should end with a redeploy.
    pub redeploy_pending: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acv(repo: &str, branch: &str, commit: &str) -> AppCodeVersion {
        AppCodeVersion {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit: commit.to_string(),
            use_latest: false,
        }
    }

    #[test]
    fn test_content_key_ignores_order_and_case() {
        let a = content_key(
            &[acv("org/app", "main", "abc123"), acv("org/lib", "dev", "def")],
            "h1",
        );
        let b = content_key(
            &[acv("Org/Lib", "DEV", "DEF"), acv("org/APP", "Main", "ABC123")],
            "h1",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_key_depends_on_infra_and_commit() {
        let base = content_key(&[acv("org/app", "main", "abc123")], "h1");
        assert_ne!(base, content_key(&[acv("org/app", "main", "abc123")], "h2"));
        assert_ne!(base, content_key(&[acv("org/app", "main", "abc124")], "h1"));
    }

    #[test]
    fn test_build_state_is_derived_from_stamps() {
        let mut build = BuildRecord::unstarted();
        assert_eq!(build.state(), BuildState::Unstarted);

        build.started = Some(Utc::now());
        assert_eq!(build.state(), BuildState::Started);

        build.completed = Some(Utc::now());
        assert_eq!(build.state(), BuildState::Completed);

        build.failed = true;
        assert_eq!(build.state(), BuildState::Failed);
        assert!(build.state().is_terminal());
    }

    #[test]
    fn test_isolation_state_round_trip() {
        for state in [
            IsolationState::Created,
            IsolationState::Killing,
            IsolationState::Killed,
            IsolationState::Redeploying,
        ] {
            assert_eq!(state.as_str().parse::<IsolationState>(), Ok(state));
        }
        assert!("paused".parse::<IsolationState>().is_err());
    }

    #[test]
    fn test_short_hash_shape() {
        let hash = new_short_hash();
        assert_eq!(hash.len(), 6);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
