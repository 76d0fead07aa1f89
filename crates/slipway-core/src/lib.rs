// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipway Core - Resource Graph Store
//!
//! This crate holds the durable state of the slipway build-and-deploy control
//! plane: contexts, context versions and their builds, build groups, instances,
//! isolation groups, users, and the job table that carries lifecycle events
//! between the orchestrator's workers.
//!
//! # Resource graph
//!
//! ```text
//!  Context ──< ContextVersion >── Build ──< Instance >── Isolation
//!                    │                          │
//!                    └── build sub-record        └── container descriptor
//! ```
//!
//! | Record | Key invariants |
//! |--------|----------------|
//! | [`graph::ContextVersion`] | build sub-record moves unstarted → started → completed/failed, once |
//! | [`graph::Instance`] | name and short hash unique per owner |
//! | [`graph::Isolation`] | exactly one master instance |
//!
//! # Backends
//!
//! [`persistence::SqliteStore`] and [`persistence::PostgresStore`] implement the
//! same repository traits. Every transition two workers could race on (build
//! start, build completion, dedup claims, container updates, isolation state,
//! job claims) is a single conditional write.
//!
//! # Dedup claims
//!
//! A build for a given owner and content key (see [`graph::content_key`]) holds a
//! row in `build_claims` until it finishes. A second request for the same key
//! reads the holder instead of starting another build.

#![deny(missing_docs)]

pub mod error;
pub mod graph;
pub mod jobs;
pub mod migrations;
pub mod persistence;

pub use error::{CoreError, Result};
pub use persistence::{PostgresStore, SqliteStore, Store};
