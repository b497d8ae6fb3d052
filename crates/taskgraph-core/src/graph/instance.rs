// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live graph and task instances, readiness and completion evaluation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::{GraphDefinition, TaskOptions, WaitPredicate};

/// Per-task state machine.
///
/// `pending → ready → leased → dispatched → {succeeded | failed | timeout | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting on upstream nodes.
    Pending,
    /// Every wait requirement is satisfied.
    Ready,
    /// A scheduler holds the lease but has not published run-task yet.
    Leased,
    /// run-task was published; a runner owns the execution.
    Dispatched,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// No result arrived before the task timeout.
    Timeout,
    /// Stopped by a cancel request.
    Cancelled,
}

impl TaskState {
    /// Every state, in lifecycle order.
    pub const ALL: [TaskState; 8] = [
        Self::Pending,
        Self::Ready,
        Self::Leased,
        Self::Dispatched,
        Self::Succeeded,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
    ];

    /// Wire/storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// `failed` or `timeout`.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Owned by a scheduler or runner.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Leased | Self::Dispatched)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized state string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for TaskState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Graph-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    /// Built but not yet handed to a scheduler.
    Pending,
    /// Schedulers may dispatch its tasks.
    Running,
    /// Every node settled without an unhandled failure.
    Succeeded,
    /// At least one node failed and nothing handled it.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl GraphStatus {
    /// Wire/storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Finalized.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphStatus {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Resolved wait edge onto a sibling task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitEdge {
    /// Sibling task id.
    pub task_id: String,
    /// Sibling label (for logs and reporting).
    pub label: String,
    /// Condition on the sibling's state.
    pub predicate: WaitPredicate,
}

impl WaitEdge {
    fn holds(&self, upstream: &TaskInstance) -> bool {
        match self.predicate {
            // ignoreFailure only rewrites the outcome for success-shaped predicates
            WaitPredicate::Failed => upstream.state.is_failure(),
            WaitPredicate::Succeeded | WaitPredicate::Finished => self
                .predicate
                .accepted_states()
                .contains(&upstream.effective_state()),
        }
    }
}

/// One top-level `waitOn` entry. Requirements are ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WaitRequirement {
    /// A single labelled predicate.
    Edge(WaitEdge),
    /// Satisfied when any member edge holds.
    AnyOf {
        /// Member edges.
        edges: Vec<WaitEdge>,
    },
}

impl WaitRequirement {
    /// Edges referenced by this requirement.
    pub fn edges(&self) -> &[WaitEdge] {
        match self {
            Self::Edge(edge) => std::slice::from_ref(edge),
            Self::AnyOf { edges } => edges,
        }
    }

    fn is_satisfied(&self, index: &HashMap<&str, &TaskInstance>) -> bool {
        self.edges().iter().any(|edge| {
            index
                .get(edge.task_id.as_str())
                .is_some_and(|upstream| edge.holds(upstream))
        })
    }

    /// Can never become satisfied: every member edge is settled against it.
    fn is_dead(&self, index: &HashMap<&str, &TaskInstance>, blocked: &HashSet<String>) -> bool {
        self.edges().iter().all(|edge| {
            if blocked.contains(&edge.task_id) {
                return true;
            }
            match index.get(edge.task_id.as_str()) {
                Some(upstream) => upstream.state.is_terminal() && !edge.holds(upstream),
                None => true,
            }
        })
    }
}

/// A task node bound into one graph instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    /// Unique task id.
    pub task_id: String,
    /// Owning graph instance.
    pub graph_id: String,
    /// Label within the graph.
    pub label: String,
    /// Scheduling domain.
    pub domain: String,
    /// Task definition name.
    pub injectable_name: String,
    /// Task kind executed by the runner.
    pub run_job: String,
    /// Current state.
    pub state: TaskState,
    /// Dispatch generation; results carrying another value are stale.
    pub attempt: u32,
    /// Retries consumed so far.
    pub retries_attempted: u32,
    /// Retries permitted before a failure propagates.
    pub retries_allowed: u32,
    /// Execution timeout in milliseconds, `-1` for unbounded.
    pub timeout_ms: i64,
    /// Failure is treated as success by downstream predicates.
    pub ignore_failure: bool,
    /// Resolved wait requirements.
    pub waiting_on: Vec<WaitRequirement>,
    /// Fully merged options.
    pub options: TaskOptions,
    /// When the current attempt was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached its terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal payload reported by the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TaskInstance {
    /// State seen by downstream `succeeded`/`finished` predicates.
    pub fn effective_state(&self) -> TaskState {
        if self.ignore_failure && self.state.is_failure() {
            TaskState::Succeeded
        } else {
            self.state
        }
    }

    /// Task has no bound on its execution time.
    pub fn is_unbounded(&self) -> bool {
        self.timeout_ms < 0
    }
}

/// One execution of a graph definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphInstance {
    /// Unique instance id.
    pub instance_id: String,
    /// Definition name.
    pub injectable_name: String,
    /// Entity the graph runs against; `None` for service graphs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Scheduling domain.
    pub domain: String,
    /// Graph status.
    pub status: GraphStatus,
    /// Daemon-style graph.
    pub service_graph: bool,
    /// Definition this instance was built from.
    pub definition: GraphDefinition,
    /// Data shared with every task.
    #[serde(default)]
    pub context: Value,
    /// Nodes keyed by label.
    pub tasks: BTreeMap<String, TaskInstance>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Finalization time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GraphInstance {
    fn index(&self) -> HashMap<&str, &TaskInstance> {
        self.tasks
            .values()
            .map(|task| (task.task_id.as_str(), task))
            .collect()
    }

    /// Look up a node by task id.
    pub fn task_by_id(&self, task_id: &str) -> Option<&TaskInstance> {
        self.tasks.values().find(|task| task.task_id == task_id)
    }

    /// Mutable lookup by task id.
    pub fn task_by_id_mut(&mut self, task_id: &str) -> Option<&mut TaskInstance> {
        self.tasks.values_mut().find(|task| task.task_id == task_id)
    }

    /// Pending/ready nodes whose every requirement is satisfied.
    pub fn ready_tasks(&self) -> Vec<&TaskInstance> {
        let index = self.index();
        self.tasks
            .values()
            .filter(|task| matches!(task.state, TaskState::Pending | TaskState::Ready))
            .filter(|task| {
                task.waiting_on
                    .iter()
                    .all(|requirement| requirement.is_satisfied(&index))
            })
            .collect()
    }

    /// Non-terminal nodes that can never become ready.
    pub fn unreachable_tasks(&self) -> HashSet<String> {
        let index = self.index();
        let mut blocked: HashSet<String> = HashSet::new();

        loop {
            let newly_blocked: Vec<String> = self
                .tasks
                .values()
                .filter(|task| !task.state.is_terminal() && !task.state.is_in_flight())
                .filter(|task| !blocked.contains(&task.task_id))
                .filter(|task| {
                    task.waiting_on
                        .iter()
                        .any(|requirement| requirement.is_dead(&index, &blocked))
                })
                .map(|task| task.task_id.clone())
                .collect();

            if newly_blocked.is_empty() {
                return blocked;
            }
            blocked.extend(newly_blocked);
        }
    }

    /// Terminal status once no reachable node is left to run.
    pub fn completion_status(&self) -> Option<GraphStatus> {
        let blocked = self.unreachable_tasks();
        let open = self
            .tasks
            .values()
            .any(|task| !task.state.is_terminal() && !blocked.contains(&task.task_id));
        if open {
            return None;
        }

        let handled: HashSet<&str> = self
            .tasks
            .values()
            .flat_map(|task| task.waiting_on.iter())
            .flat_map(|requirement| requirement.edges())
            .filter(|edge| edge.predicate == WaitPredicate::Failed)
            .map(|edge| edge.task_id.as_str())
            .collect();

        let failed = self.tasks.values().any(|task| {
            task.state.is_failure()
                && !task.ignore_failure
                && !handled.contains(task.task_id.as_str())
        });

        if failed {
            Some(GraphStatus::Failed)
        } else if self
            .tasks
            .values()
            .any(|task| task.state == TaskState::Cancelled)
        {
            Some(GraphStatus::Cancelled)
        } else {
            Some(GraphStatus::Succeeded)
        }
    }
}
