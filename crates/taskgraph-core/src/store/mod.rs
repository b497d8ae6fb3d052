// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store interface and backends.
//!
//! The store owns every piece of shared state: definitions, graph and task
//! instances, leases, completed-task bookkeeping rows and the `taskevents` log
//! tailed by the storage messenger. Every mutation of a task is a conditional
//! update keyed by task id and attempt, so concurrent schedulers and pollers
//! can race on the same rows without corrupting them. The store also enforces
//! that at most one pending or running graph is bound to a target.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::graph::{
    GraphDefinition, GraphInstance, GraphStatus, TaskDefinition, TaskInstance, TaskState,
    UnknownState,
};

/// Time-bounded ownership claim on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased task.
    pub task_id: String,
    /// Owning scheduler.
    pub scheduler_id: String,
    /// When the lease was first granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Lease valid for `duration` from `now`.
    pub fn new(
        task_id: impl Into<String>,
        scheduler_id: impl Into<String>,
        now: DateTime<Utc>,
        duration: chrono::Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            scheduler_id: scheduler_id.into(),
            acquired_at: now,
            expires_at: now + duration,
        }
    }

    /// Still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Terminal outcome written by [`Store::finish_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask {
    /// Task id.
    pub task_id: String,
    /// Owning graph.
    pub graph_id: String,
    /// Scheduling domain.
    pub domain: String,
    /// Attempt the outcome belongs to.
    pub attempt: u32,
    /// Terminal state.
    pub state: TaskState,
    /// Optional payload from the task.
    pub detail: Option<Value>,
    /// When the attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When it finished.
    pub finished_at: DateTime<Utc>,
}

/// Bookkeeping row left for the completed task poller.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTaskRecord {
    /// Monotonic row id.
    pub id: i64,
    /// Finished task.
    pub task_id: String,
    /// Owning graph.
    pub graph_id: String,
    /// Scheduling domain.
    pub domain: String,
    /// Terminal state.
    pub state: TaskState,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Kind of a `taskevents` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventAction {
    /// run-task, routed by domain.
    Run,
    /// cancel-task, routed by task id.
    Cancel,
    /// task-finished, routed by domain.
    Finished,
    /// cancel-graph, unrouted.
    CancelGraph,
    /// graph-finished, unrouted.
    GraphFinished,
}

impl TaskEventAction {
    /// Storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::Finished => "finished",
            Self::CancelGraph => "cancel-graph",
            Self::GraphFinished => "graph-finished",
        }
    }
}

impl fmt::Display for TaskEventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventAction {
    type Err = UnknownState;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "cancel" => Ok(Self::Cancel),
            "finished" => Ok(Self::Finished),
            "cancel-graph" => Ok(Self::CancelGraph),
            "graph-finished" => Ok(Self::GraphFinished),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// One record of the `taskevents` log.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEventRecord {
    /// Monotonic sequence id.
    pub id: i64,
    /// Event class.
    pub action: TaskEventAction,
    /// Domain, task id, or empty for cancel-graph.
    pub routing_key: String,
    /// JSON wire event.
    pub payload: Value,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Shared durable state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend identifier (e.g., "memory", "sqlite").
    fn backend(&self) -> &'static str;

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Upsert a task definition by name.
    async fn put_task_definition(&self, definition: &TaskDefinition) -> Result<()>;

    /// All persisted task definitions.
    async fn get_task_definitions(&self) -> Result<Vec<TaskDefinition>>;

    /// Remove a task definition. Returns whether it existed.
    async fn delete_task_definition(&self, injectable_name: &str) -> Result<bool>;

    /// Upsert a graph definition by name.
    async fn put_graph_definition(&self, definition: &GraphDefinition) -> Result<()>;

    /// All persisted graph definitions.
    async fn get_graph_definitions(&self) -> Result<Vec<GraphDefinition>>;

    /// Remove a graph definition. Returns whether it existed.
    async fn delete_graph_definition(&self, injectable_name: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Graph instances
    // ------------------------------------------------------------------

    /// Persist a new graph instance together with its tasks.
    ///
    /// Fails with [`Error::DuplicateActiveGraph`](crate::error::Error::DuplicateActiveGraph)
    /// when another pending or running graph is bound to the same target;
    /// nothing is written in that case.
    async fn insert_graph(&self, graph: &GraphInstance) -> Result<()>;

    /// Load a graph instance with the current state of every task.
    async fn get_graph(&self, instance_id: &str) -> Result<Option<GraphInstance>>;

    /// Status of a graph without loading its tasks.
    async fn get_graph_status(&self, instance_id: &str) -> Result<Option<GraphStatus>>;

    /// The pending or running graph bound to `target`, if any.
    async fn find_active_graph_for_target(&self, target: &str) -> Result<Option<GraphInstance>>;

    /// Every pending or running graph, across domains.
    async fn find_active_graphs(&self) -> Result<Vec<GraphInstance>>;

    /// Running graphs of a domain.
    async fn find_running_graphs(&self, domain: &str) -> Result<Vec<GraphInstance>>;

    /// Every service-graph instance, regardless of status.
    async fn find_service_graphs(&self) -> Result<Vec<GraphInstance>>;

    /// Finalize a running graph. Only the first caller gets `true`.
    async fn set_graph_done(
        &self,
        instance_id: &str,
        status: GraphStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a graph with its tasks, leases and bookkeeping rows.
    async fn delete_graph(&self, instance_id: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Task instances
    // ------------------------------------------------------------------

    /// Load one task.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskInstance>>;

    /// Move a task from one of `from` to `to` if its attempt still matches.
    async fn transition_task(
        &self,
        task_id: &str,
        attempt: u32,
        from: &[TaskState],
        to: TaskState,
    ) -> Result<bool>;

    /// `leased → dispatched`, stamping the start time.
    async fn mark_dispatched(
        &self,
        task_id: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Return an orphaned in-flight task to `ready` under a new attempt.
    async fn reoffer_task(&self, task_id: &str, attempt: u32) -> Result<bool>;

    /// Return a non-terminal task to `pending`, consuming one retry.
    async fn retry_task(&self, task_id: &str, attempt: u32) -> Result<bool>;

    /// Record a terminal outcome and queue a completed-task row.
    ///
    /// Returns `false` when the attempt is stale or the task is already
    /// terminal; nothing is written in that case.
    async fn finish_task(&self, finished: &FinishedTask) -> Result<bool>;

    /// Oldest completed-task rows of a domain.
    async fn find_completed_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<CompletedTaskRecord>>;

    /// Delete completed-task rows by id.
    async fn delete_completed_tasks(&self, ids: &[i64]) -> Result<u64>;

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Create the lease unless a valid one exists for the task.
    async fn acquire_lease(&self, lease: &Lease) -> Result<bool>;

    /// Extend a lease still held by `scheduler_id`.
    async fn renew_lease(
        &self,
        task_id: &str,
        scheduler_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease of a task.
    async fn release_lease(&self, task_id: &str) -> Result<bool>;

    /// Current lease of a task, valid or not.
    async fn get_lease(&self, task_id: &str) -> Result<Option<Lease>>;

    /// Leases that expired before `now`.
    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lease>>;

    /// Delete a lease if it is still expired at `now`.
    async fn expire_lease(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool>;

    // ------------------------------------------------------------------
    // taskevents log
    // ------------------------------------------------------------------

    /// Append an event; returns its sequence id.
    async fn append_task_event(
        &self,
        action: TaskEventAction,
        routing_key: &str,
        payload: &Value,
    ) -> Result<i64>;

    /// Highest sequence id written so far (0 when empty).
    async fn latest_task_event_id(&self) -> Result<i64>;

    /// Events after `after_id`, oldest first.
    async fn find_task_events(
        &self,
        action: TaskEventAction,
        routing_key: Option<&str>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TaskEventRecord>>;

    /// Delete events appended before `older_than`. Sequence ids are never
    /// reused, so cursors held by subscribers stay valid.
    async fn prune_task_events(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
