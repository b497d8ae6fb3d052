// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! taskgraph-core - Distributed Task-Graph Orchestration
//!
//! This crate runs graphs of dependent tasks across a pool of cooperating
//! processes. A graph is a DAG of labelled task nodes; a node becomes ready once
//! the predicates on its upstream nodes hold, is leased by exactly one
//! scheduler, executed by a runner and settled as `succeeded`, `failed`,
//! `timeout` or `cancelled`. A graph finishes once no reachable node is left.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Registry (definitions, active graphs)            │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ create_graph                          ▲ complete_active_graph
//!        ▼                                       │
//! ┌──────────────┐  run-task   ┌──────────────┐  │  ┌──────────────────────┐
//! │  Scheduler   │────────────►│ Task Runner  │  └──│ Completed Task Poller│
//! │ (per domain) │◄────────────│ (TaskKinds)  │     └──────────────────────┘
//! └──────────────┘ task-finished└──────────────┘               ▲
//!     │  ▲ cancel-graph            ▲ cancel-task               │
//!     │  │                         │                           │
//!     │  └──────── Service Graph Manager ───┘                  │
//!     ▼                                                        │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   Store (memory | sqlite): definitions, graphs, tasks, leases,       │
//! │   completed-task rows, taskevents log                                │
//! └──────────────────────────────────────────────────────────────────────┘
//!                           ▲
//!                Lease Expiration Poller
//! ```
//!
//! Schedulers and runners only talk through a [`messenger::Messenger`];
//! everything else goes through a [`store::Store`]. The lease is the only
//! point of mutual exclusion between processes; every other write is a
//! conditional update keyed by task id and attempt, and the store refuses a
//! second live graph on a target.
//!
//! # Events
//!
//! | Event | Routing | Payload |
//! |-------|---------|---------|
//! | run-task | domain | `{domain, taskId, graphId, attempt}` |
//! | cancel-task | task id | `{taskId}` |
//! | task-finished | domain | `{domain, taskId, graphId, state, detail?, stats, attempt}` |
//! | cancel-graph | - | `{graphId?}` |
//! | graph-finished | - | `{graphId, status, domain, target?}` |
//!
//! # Configuration
//!
//! The standalone binary reads `TASKGRAPH_*` environment variables, see
//! [`config::Config::from_env`]. Embedders use
//! [`runtime::TaskGraphRuntime::builder`] directly.

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Graph/task dependency model, builder and validator.
pub mod graph;

/// Explicit definition manifests.
pub mod manifest;

/// Pub/sub transport (broker and storage-poll backings).
pub mod messenger;

/// Embedded SQLite migrations.
pub mod migrations;

/// Definition catalogs and the active-graph index.
pub mod registry;

/// Task kinds and the worker executing them.
pub mod runner;

/// Per-domain scheduler.
pub mod scheduler;

/// Persistent state (memory and SQLite backings).
pub mod store;

/// Background worker reclaiming expired leases and trimming the event log.
pub mod lease_expiration_poller;

/// Background worker finalizing graphs.
pub mod completed_task_poller;

/// Service graph reconciliation.
pub mod service_graph;

/// Embeddable runtime wiring every worker.
pub mod runtime;

pub use error::{Error, Result};
