// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative graph and task definitions.
//!
//! These are the static templates loaded from the definition manifest or the
//! store. Field names follow the camelCase wire format:
//!
//! ```json
//! {
//!   "injectableName": "Graph.Discovery",
//!   "friendlyName": "Discovery",
//!   "options": { "defaults": { "retries": 1 }, "catalog-bmc": { "port": 623 } },
//!   "tasks": [
//!     { "label": "catalog-dmi", "taskName": "Task.Catalog.dmi" },
//!     { "label": "catalog-bmc", "taskName": "Task.Catalog.bmc",
//!       "waitOn": { "catalog-dmi": "finished" }, "ignoreFailure": true }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::instance::TaskState;

/// Option map passed to a task (and used for every merge layer).
pub type TaskOptions = Map<String, Value>;

/// Key of the `anyOf` group inside a `waitOn` map.
pub const ANY_OF_KEY: &str = "anyOf";

/// Pseudo-label in graph/run options applied to every node.
pub const DEFAULTS_KEY: &str = "defaults";

/// Static template for a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique catalog key.
    pub injectable_name: String,
    /// Human-readable name.
    #[serde(default)]
    pub friendly_name: String,
    /// Base task this definition specializes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implements_task: Option<String>,
    /// Task kind executed by the runner. Usually set on base tasks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_job: Option<String>,
    /// Default option values.
    #[serde(default)]
    pub options: TaskOptions,
    /// Option keys that must be present once every layer is merged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_options: Vec<String>,
    /// Opaque descriptive properties.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

impl TaskDefinition {
    /// Definition that runs `run_job` directly.
    pub fn base(injectable_name: impl Into<String>, run_job: impl Into<String>) -> Self {
        let injectable_name = injectable_name.into();
        Self {
            friendly_name: injectable_name.clone(),
            injectable_name,
            implements_task: None,
            run_job: Some(run_job.into()),
            options: TaskOptions::new(),
            required_options: Vec::new(),
            properties: Value::Null,
        }
    }

    /// Definition that specializes the base task `implements_task`.
    pub fn implementing(
        injectable_name: impl Into<String>,
        implements_task: impl Into<String>,
    ) -> Self {
        let injectable_name = injectable_name.into();
        Self {
            friendly_name: injectable_name.clone(),
            injectable_name,
            implements_task: Some(implements_task.into()),
            run_job: None,
            options: TaskOptions::new(),
            required_options: Vec::new(),
            properties: Value::Null,
        }
    }

    /// Replace the default options.
    pub fn with_options(mut self, options: Value) -> Self {
        if let Value::Object(map) = options {
            self.options = map;
        }
        self
    }
}

/// Named wait condition evaluated against a sibling's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPredicate {
    /// Sibling succeeded.
    Succeeded,
    /// Sibling failed or timed out.
    Failed,
    /// Sibling reached any terminal state.
    Finished,
}

impl WaitPredicate {
    /// Task states that satisfy this predicate.
    pub fn accepted_states(self) -> &'static [TaskState] {
        match self {
            Self::Succeeded => &[TaskState::Succeeded],
            Self::Failed => &[TaskState::Failed, TaskState::Timeout],
            Self::Finished => &[
                TaskState::Succeeded,
                TaskState::Failed,
                TaskState::Timeout,
                TaskState::Cancelled,
            ],
        }
    }
}

impl fmt::Display for WaitPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Value of a `waitOn` entry: a predicate, or (under `anyOf`) a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitOnValue {
    /// `"label": "succeeded"`
    Predicate(WaitPredicate),
    /// `"anyOf": { "a": "succeeded", "b": "succeeded" }`
    Group(BTreeMap<String, WaitPredicate>),
}

/// One node of a graph definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTaskNode {
    /// Unique label within the graph.
    pub label: String,
    /// Reference into the task catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Inline definition; takes precedence over `task_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<TaskDefinition>,
    /// Wait edges keyed by sibling label (or `anyOf`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wait_on: BTreeMap<String, WaitOnValue>,
    /// Downstream predicates treat a failure of this node as success.
    #[serde(default)]
    pub ignore_failure: bool,
    /// Per-node option overrides.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub option_overrides: TaskOptions,
}

impl GraphTaskNode {
    /// Node referencing a catalog task.
    pub fn new(label: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            task_name: Some(task_name.into()),
            task_definition: None,
            wait_on: BTreeMap::new(),
            ignore_failure: false,
            option_overrides: TaskOptions::new(),
        }
    }

    /// Add a `label → predicate` wait edge.
    pub fn wait_on(mut self, label: impl Into<String>, predicate: WaitPredicate) -> Self {
        self.wait_on
            .insert(label.into(), WaitOnValue::Predicate(predicate));
        self
    }

    /// Set the `anyOf` group.
    pub fn wait_on_any(mut self, group: &[(&str, WaitPredicate)]) -> Self {
        let group = group
            .iter()
            .map(|(label, predicate)| (label.to_string(), *predicate))
            .collect();
        self.wait_on
            .insert(ANY_OF_KEY.to_string(), WaitOnValue::Group(group));
        self
    }

    /// Mark the node as `ignoreFailure`.
    pub fn ignoring_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }
}

/// Static, reusable graph template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    /// Globally unique name.
    pub injectable_name: String,
    /// Human-readable name.
    #[serde(default)]
    pub friendly_name: String,
    /// Label-keyed option overrides (plus `defaults`).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: TaskOptions,
    /// Daemon-style graph with no bound target.
    #[serde(default)]
    pub service_graph: bool,
    /// Ordered nodes.
    pub tasks: Vec<GraphTaskNode>,
}

impl GraphDefinition {
    /// Empty graph definition.
    pub fn new(injectable_name: impl Into<String>) -> Self {
        let injectable_name = injectable_name.into();
        Self {
            friendly_name: injectable_name.clone(),
            injectable_name,
            options: TaskOptions::new(),
            service_graph: false,
            tasks: Vec::new(),
        }
    }

    /// Append a node.
    pub fn task(mut self, node: GraphTaskNode) -> Self {
        self.tasks.push(node);
        self
    }

    /// Mark as a service graph.
    pub fn service(mut self) -> Self {
        self.service_graph = true;
        self
    }

    /// Find a node by label.
    pub fn node(&self, label: &str) -> Option<&GraphTaskNode> {
        self.tasks.iter().find(|node| node.label == label)
    }
}
