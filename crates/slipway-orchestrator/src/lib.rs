// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipway Orchestrator - Build and Deploy Control Plane
//!
//! This crate turns source snapshots into running containers. It deduplicates
//! builds, drives image-builder containers, fans completed builds out to the
//! instances that use them, forks instances for new branches and keeps
//! isolation groups consistent.
//!
//! # Architecture
//!
//! ```text
//!   docks (container events)            operators / hooks
//!            │                                  │
//!            ▼                                  ▼
//! ┌──────────────────────┐        ┌──────────────────────────────┐
//! │      jobs table      │◄───────│ request_build / fan_out_build │
//! │  (slipway-core)      │        │ auto_fork / isolate           │
//! └──────────────────────┘        └──────────────────────────────┘
//!            │ claim                            │
//!            ▼                                  ▼
//! ┌──────────────────────┐        ┌──────────────────────────────┐
//! │      JobWorker       │───────▶│  build / deploy / isolation  │
//! │  dispatch by queue   │        │  handlers                    │
//! └──────────────────────┘        └──────────────────────────────┘
//!                                               │
//!                         ┌─────────────────────┼───────────────────┐
//!                         ▼                     ▼                   ▼
//!                   DockFinder          ContainerRuntime        Notifier
//! ```
//!
//! # Queues
//!
//! | Queue | Direction | Handler |
//! |-------|-----------|---------|
//! | `build.container.died` | in | [`build::complete_build`] |
//! | `instance.container.died`, `application.container.died` | in | [`isolation::handle_instance_died`] |
//! | `container.network.attached` | in | [`handlers::handle_network_attached`] |
//! | `instance.deployed` | in/out | [`handlers::handle_instance_deployed`] |
//! | `instance.rebuild` | in | [`handlers::rebuild_instance`] |
//! | `createImageBuilderContainer` | in/out | [`build::create_image_builder`] |
//! | `createInstanceContainer` | in/out | [`deploy::create_instance_container`] |
//! | `killIsolation` | in/out | [`isolation::kill_isolation`] |
//! | `dock.removed` | in | [`dock::handle_dock_removed`] |
//! | `clearContainerMemory`, `pushImage` | out | dock agents |
//!
//! # Concurrency
//!
//! Handlers hold no locks. Every transition that two workers could race on is
//! a conditional write in the store, so the worker can run any number of
//! copies against the same database.

#![deny(missing_docs)]

pub mod build;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod deploy;
pub mod dock;
pub mod error;
pub mod fork;
pub mod handlers;
pub mod isolation;
pub mod publisher;
pub mod reaper;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::OrchestratorRuntime;
pub use state::OrchestratorState;
