// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pub/sub transport between schedulers, runners and pollers.
//!
//! Five event classes flow through a [`Messenger`]:
//!
//! | Event | Routing key | Producer | Consumer |
//! |-------|-------------|----------|----------|
//! | run-task | domain | Scheduler | Task Runner |
//! | cancel-task | task id | Scheduler, Service Graph Manager | Task Runner |
//! | task-finished | domain | Task Runner | Scheduler, Completed Task Poller |
//! | cancel-graph | none | Service Graph Manager, embedders | Scheduler |
//! | graph-finished | none | Completed Task Poller | Completed Task Poller, embedders |
//!
//! Delivery is at-least-once. Consumers deduplicate on task id plus attempt.

pub mod broker;
pub mod storage;

pub use self::broker::BrokerMessenger;
pub use self::storage::StorageMessenger;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, MessengerKind};
use crate::error::Result;
use crate::graph::{GraphStatus, TaskState};
use crate::store::Store;

/// Buffered events per subscription before the forwarder waits.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;

/// Ask a runner in `domain` to execute a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskEvent {
    /// Scheduling domain.
    pub domain: String,
    /// Task to run.
    pub task_id: String,
    /// Owning graph.
    pub graph_id: String,
    /// Dispatch generation.
    #[serde(default)]
    pub attempt: u32,
}

/// Ask whoever runs a task to stop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskEvent {
    /// Task to cancel.
    pub task_id: String,
}

/// Execution timestamps reported by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    /// When execution began.
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    /// When execution ended.
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

/// Outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishedEvent {
    /// Scheduling domain.
    pub domain: String,
    /// Finished task.
    pub task_id: String,
    /// Owning graph.
    pub graph_id: String,
    /// Terminal state reported by the runner.
    pub state: TaskState,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Execution timestamps.
    #[serde(default)]
    pub stats: TaskStats,
    /// Attempt the outcome belongs to.
    #[serde(default)]
    pub attempt: u32,
}

/// Ask schedulers to cancel every task of a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelGraphEvent {
    /// Graph to cancel. Events without one are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
}

/// A graph was finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFinishedEvent {
    /// Finalized graph.
    pub graph_id: String,
    /// Terminal status written to the store.
    pub status: GraphStatus,
    /// Scheduling domain.
    #[serde(default)]
    pub domain: String,
    /// Target the graph was bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Live subscription; dropping it unsubscribes.
pub struct Subscription<E> {
    rx: mpsc::Receiver<E>,
    forwarder: JoinHandle<()>,
}

impl<E> Subscription<E> {
    pub(crate) fn new(rx: mpsc::Receiver<E>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Next event, or `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Transport used by every worker.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Backend identifier (e.g., "broker", "storage-poll").
    fn backend(&self) -> &'static str;

    /// Prepare the transport. Idempotent.
    async fn start(&self) -> Result<()>;

    /// run-task events for a domain.
    async fn subscribe_run_task(&self, domain: &str) -> Result<Subscription<RunTaskEvent>>;

    /// Publish run-task, routed by `event.domain`.
    async fn publish_run_task(&self, event: &RunTaskEvent) -> Result<()>;

    /// cancel-task events for one task.
    async fn subscribe_cancel_task(&self, task_id: &str) -> Result<Subscription<CancelTaskEvent>>;

    /// Publish cancel-task, routed by `event.task_id`.
    async fn publish_cancel_task(&self, event: &CancelTaskEvent) -> Result<()>;

    /// task-finished events for a domain.
    async fn subscribe_task_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<TaskFinishedEvent>>;

    /// Publish task-finished, routed by `event.domain`.
    async fn publish_task_finished(&self, event: &TaskFinishedEvent) -> Result<()>;

    /// Every cancel-graph event.
    async fn subscribe_cancel_graph(&self) -> Result<Subscription<CancelGraphEvent>>;

    /// Publish cancel-graph.
    async fn publish_cancel_graph(&self, event: &CancelGraphEvent) -> Result<()>;

    /// Every graph-finished event.
    async fn subscribe_graph_finished(&self) -> Result<Subscription<GraphFinishedEvent>>;

    /// Publish graph-finished.
    async fn publish_graph_finished(&self, event: &GraphFinishedEvent) -> Result<()>;
}

/// Build the messenger selected by configuration.
pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Arc<dyn Messenger> {
    match config.messenger {
        MessengerKind::Broker => Arc::new(BrokerMessenger::default()),
        MessengerKind::StoragePoll => Arc::new(StorageMessenger::new(
            store,
            Duration::from_millis(config.poll_interval_ms),
        )),
    }
}
