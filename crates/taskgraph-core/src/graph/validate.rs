// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural validation of graph definitions.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::catalog::TaskCatalog;
use super::definition::{ANY_OF_KEY, GraphDefinition, GraphTaskNode, TaskDefinition, WaitOnValue};

/// Reasons a graph definition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// The graph has no nodes.
    #[error("graph '{graph}' has no tasks")]
    EmptyGraph {
        /// Graph name.
        graph: String,
    },

    /// Two nodes share a label.
    #[error("duplicate task label '{0}'")]
    DuplicateLabel(String),

    /// Node has neither or both of `taskName` and `taskDefinition`.
    #[error("task '{label}' must specify exactly one of taskName or taskDefinition")]
    InvalidNode {
        /// Offending node.
        label: String,
    },

    /// A `waitOn` key names no sibling.
    #[error("task '{label}' waits on unknown label '{wait_on}'")]
    UnknownLabel {
        /// Waiting node.
        label: String,
        /// Missing label.
        wait_on: String,
    },

    /// A group value outside `anyOf`, or an empty `anyOf`.
    #[error("task '{label}' has an invalid waitOn entry '{key}'")]
    InvalidWaitOn {
        /// Waiting node.
        label: String,
        /// Offending key.
        key: String,
    },

    /// A task reference is not in the catalog.
    #[error("task '{label}' references unknown task '{task_name}'")]
    UnknownTask {
        /// Node label.
        label: String,
        /// Missing task name.
        task_name: String,
    },

    /// The `implementsTask` chain never names a `runJob`.
    #[error("task '{task_name}' does not resolve to a runJob")]
    MissingRunJob {
        /// Task definition name.
        task_name: String,
    },

    /// A required option is absent after every layer was merged.
    #[error("task '{label}' is missing required option '{option}'")]
    MissingOption {
        /// Node label.
        label: String,
        /// Option key.
        option: String,
    },

    /// The wait edges contain a cycle.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Labels along the cycle, first label repeated at the end.
        path: Vec<String>,
    },
}

/// Definition a node runs: inline first, then catalog lookup.
pub(crate) fn node_definition<'a>(
    node: &'a GraphTaskNode,
    catalog: &'a TaskCatalog,
) -> Result<&'a TaskDefinition, ValidationError> {
    match (&node.task_definition, &node.task_name) {
        (Some(inline), None) => Ok(inline),
        (None, Some(name)) => catalog.get(name).ok_or_else(|| ValidationError::UnknownTask {
            label: node.label.clone(),
            task_name: name.clone(),
        }),
        _ => Err(ValidationError::InvalidNode {
            label: node.label.clone(),
        }),
    }
}

/// Labels a node waits on, in `waitOn` order.
fn upstream_labels(node: &GraphTaskNode) -> Result<Vec<&str>, ValidationError> {
    let mut labels = Vec::new();
    for (key, value) in &node.wait_on {
        match value {
            WaitOnValue::Group(group) if key == ANY_OF_KEY && !group.is_empty() => {
                labels.extend(group.keys().map(String::as_str));
            }
            WaitOnValue::Predicate(_) if key != ANY_OF_KEY => labels.push(key.as_str()),
            _ => {
                return Err(ValidationError::InvalidWaitOn {
                    label: node.label.clone(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(labels)
}

/// Validate a graph definition against a task catalog.
///
/// Checks labels, task references, `waitOn` shape and that the wait edges
/// form a DAG.
pub fn validate(definition: &GraphDefinition, catalog: &TaskCatalog) -> Result<(), ValidationError> {
    if definition.tasks.is_empty() {
        return Err(ValidationError::EmptyGraph {
            graph: definition.injectable_name.clone(),
        });
    }

    let mut labels: HashSet<&str> = HashSet::new();
    for node in &definition.tasks {
        if !labels.insert(node.label.as_str()) {
            return Err(ValidationError::DuplicateLabel(node.label.clone()));
        }
    }

    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &definition.tasks {
        let task = node_definition(node, catalog)?;
        catalog.resolve(&node.label, task)?;

        let upstream = upstream_labels(node)?;
        for wait_on in &upstream {
            if !labels.contains(wait_on) {
                return Err(ValidationError::UnknownLabel {
                    label: node.label.clone(),
                    wait_on: wait_on.to_string(),
                });
            }
        }
        edges.insert(node.label.as_str(), upstream);
    }

    detect_cycle(definition, &edges)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search with a visiting set; a back-edge is a cycle.
fn detect_cycle(
    definition: &GraphDefinition,
    edges: &HashMap<&str, Vec<&str>>,
) -> Result<(), ValidationError> {
    fn visit<'a>(
        label: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), ValidationError> {
        match marks.get(label) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|l| *l == label).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|l| l.to_string()).collect();
                path.push(label.to_string());
                return Err(ValidationError::CycleDetected { path });
            }
            None => {}
        }

        marks.insert(label, Mark::Visiting);
        stack.push(label);
        if let Some(upstream) = edges.get(label) {
            for next in upstream {
                visit(*next, edges, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(label, Mark::Done);
        Ok(())
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    for node in &definition.tasks {
        visit(node.label.as_str(), edges, &mut marks, &mut stack)?;
    }
    Ok(())
}
