// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recording collaborators for tests.
//!
//! Every mock is cheap to clone; clones share state, so a test can hand one
//! clone to the orchestrator and inspect another.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use slipway_core::graph::{ContextVersion, Instance, Owner};
use tokio::sync::Mutex;

use super::{
    CollaboratorError, ContainerRuntime, DockFinder, ImageBuilderSpec, InstanceContainerSpec,
    Notifier, Result,
};

/// Placement that always answers with one dock unless told to fail.
#[derive(Debug, Clone)]
pub struct MockDockFinder {
    dock: Arc<Mutex<String>>,
    unavailable: Arc<Mutex<HashSet<String>>>,
    failures: Arc<Mutex<VecDeque<CollaboratorError>>>,
    lookups: Arc<AtomicUsize>,
}

impl MockDockFinder {
    /// Placement that picks `dock`.
    pub fn new(dock: impl Into<String>) -> Self {
        Self {
            dock: Arc::new(Mutex::new(dock.into())),
            unavailable: Arc::new(Mutex::new(HashSet::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Change the dock handed out from now on.
    pub async fn set_dock(&self, dock: impl Into<String>) {
        *self.dock.lock().await = dock.into();
    }

    /// Report `dock` as unavailable.
    pub async fn set_unavailable(&self, dock: impl Into<String>) {
        self.unavailable.lock().await.insert(dock.into());
    }

    /// Fail the next `count` dock lookups with `err`.
    pub async fn fail_next(&self, count: usize, err: CollaboratorError) {
        let mut failures = self.failures.lock().await;
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    /// Number of `find_dock_*` calls so far, failed ones included.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    async fn pick(&self) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        Ok(self.dock.lock().await.clone())
    }
}

impl Default for MockDockFinder {
    fn default() -> Self {
        Self::new("http://10.0.0.1:4242")
    }
}

#[async_trait]
impl DockFinder for MockDockFinder {
    async fn find_dock_for_build(&self, _owner: &Owner, _cv: &ContextVersion) -> Result<String> {
        self.pick().await
    }

    async fn find_dock_for_container(
        &self,
        _owner: &Owner,
        _cv: &ContextVersion,
    ) -> Result<String> {
        self.pick().await
    }

    async fn is_dock_available(&self, docker_host: &str) -> Result<bool> {
        Ok(!self.unavailable.lock().await.contains(docker_host))
    }
}

/// Container runtime that records what it was asked to create and kill.
#[derive(Debug, Clone, Default)]
pub struct MockContainerRuntime {
    builders: Arc<Mutex<Vec<ImageBuilderSpec>>>,
    containers: Arc<Mutex<Vec<InstanceContainerSpec>>>,
    kills: Arc<Mutex<Vec<(String, String)>>>,
    create_failures: Arc<Mutex<VecDeque<CollaboratorError>>>,
    kill_failures: Arc<Mutex<VecDeque<CollaboratorError>>>,
    create_attempts: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl MockContainerRuntime {
    /// New runtime with no scripted failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` create calls (builder or instance) with `err`.
    pub async fn fail_creates(&self, count: usize, err: CollaboratorError) {
        let mut failures = self.create_failures.lock().await;
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    /// Fail the next `count` kill calls with `err`.
    pub async fn fail_kills(&self, count: usize, err: CollaboratorError) {
        let mut failures = self.kill_failures.lock().await;
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    /// Image builders created so far.
    pub async fn builders(&self) -> Vec<ImageBuilderSpec> {
        self.builders.lock().await.clone()
    }

    /// Instance containers created so far.
    pub async fn instance_containers(&self) -> Vec<InstanceContainerSpec> {
        self.containers.lock().await.clone()
    }

    /// `(docker_host, container_id)` of every successful kill.
    pub async fn kills(&self) -> Vec<(String, String)> {
        self.kills.lock().await.clone()
    }

    /// Create calls so far, failed ones included.
    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    async fn next_container(&self) -> Result<String> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().await.pop_front() {
            return Err(err);
        }
        Ok(format!(
            "container-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn create_image_builder(&self, spec: &ImageBuilderSpec) -> Result<String> {
        let id = self.next_container().await?;
        self.builders.lock().await.push(spec.clone());
        Ok(id)
    }

    async fn create_instance_container(&self, spec: &InstanceContainerSpec) -> Result<String> {
        let id = self.next_container().await?;
        self.containers.lock().await.push(spec.clone());
        Ok(id)
    }

    async fn kill_container(&self, docker_host: &str, container_id: &str) -> Result<()> {
        if let Some(err) = self.kill_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.kills
            .lock()
            .await
            .push((docker_host.to_string(), container_id.to_string()));
        Ok(())
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// `instance_updated`
    InstanceUpdated {
        /// Instance id.
        instance_id: String,
        /// Action name.
        action: String,
    },
    /// `build_completed`
    BuildCompleted {
        /// Context version id.
        context_version_id: String,
        /// Build failed.
        failed: bool,
    },
    /// `instance_deployed`
    InstanceDeployed {
        /// Instance id.
        instance_id: String,
        /// Context version id.
        context_version_id: String,
    },
}

/// Notifier that keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<NotifyEvent>>>,
}

impl RecordingNotifier {
    /// New empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events so far, oldest first.
    pub async fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn instance_updated(&self, instance: &Instance, action: &str) {
        self.events.lock().await.push(NotifyEvent::InstanceUpdated {
            instance_id: instance.id.clone(),
            action: action.to_string(),
        });
    }

    async fn build_completed(&self, cv: &ContextVersion) {
        self.events.lock().await.push(NotifyEvent::BuildCompleted {
            context_version_id: cv.id.clone(),
            failed: cv.build.failed,
        });
    }

    async fn instance_deployed(&self, instance_id: &str, context_version_id: &str) {
        self.events.lock().await.push(NotifyEvent::InstanceDeployed {
            instance_id: instance_id.to_string(),
            context_version_id: context_version_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let runtime = MockContainerRuntime::new();
        runtime
            .fail_kills(1, CollaboratorError::Unavailable("dock down".into()))
            .await;

        assert!(runtime.kill_container("h", "c1").await.is_err());
        runtime.kill_container("h", "c1").await.unwrap();
        assert_eq!(runtime.kills().await, vec![("h".to_string(), "c1".to_string())]);
    }

    #[tokio::test]
    async fn test_dock_finder_clones_share_state() {
        let finder = MockDockFinder::new("dock-a");
        let clone = finder.clone();
        clone.set_unavailable("dock-a").await;
        assert!(!finder.is_dock_available("dock-a").await.unwrap());
        assert!(finder.is_dock_available("dock-b").await.unwrap());
    }
}
