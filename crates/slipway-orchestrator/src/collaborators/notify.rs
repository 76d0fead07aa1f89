// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notifier that writes events to the log.

use async_trait::async_trait;
use slipway_core::graph::{ContextVersion, Instance};
use tracing::info;

use super::Notifier;

/// [`Notifier`] that emits each event as a structured `tracing` record.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn instance_updated(&self, instance: &Instance, action: &str) {
        info!(
            instance_id = %instance.id,
            instance_name = %instance.name,
            context_version_id = %instance.context_version.id,
            action,
            "Instance updated"
        );
    }

    async fn build_completed(&self, cv: &ContextVersion) {
        info!(
            context_version_id = %cv.id,
            build_id = %cv.build.id,
            failed = cv.build.failed,
            "Build completed"
        );
    }

    async fn instance_deployed(&self, instance_id: &str, context_version_id: &str) {
        info!(instance_id, context_version_id, "Instance deployed");
    }
}
