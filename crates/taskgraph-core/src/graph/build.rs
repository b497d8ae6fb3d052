// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instantiating a graph definition.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use super::catalog::TaskCatalog;
use super::definition::{ANY_OF_KEY, DEFAULTS_KEY, GraphDefinition, TaskOptions, WaitOnValue};
use super::instance::{GraphInstance, GraphStatus, TaskInstance, TaskState, WaitEdge, WaitRequirement};
use super::validate::{ValidationError, node_definition, validate};

/// Option key carrying the per-task timeout in milliseconds.
pub const TASK_TIMEOUT_OPTION: &str = "_taskTimeout";

/// Option key carrying scheduler hints (`timeout`, `retries`).
pub const SCHEDULER_OVERRIDES_OPTION: &str = "schedulerOverrides";

/// Run-time parameters for [`build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Reuse an instance id instead of generating one.
    pub instance_id: Option<String>,
    /// Entity the graph runs against.
    pub target: Option<String>,
    /// Scheduling domain.
    pub domain: String,
    /// Label-keyed run options (plus `defaults`); the highest-precedence layer.
    pub options: TaskOptions,
    /// Timeout applied when no layer sets one (`-1` unbounded).
    pub default_timeout_ms: i64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            instance_id: None,
            target: None,
            domain: "default".to_string(),
            options: TaskOptions::new(),
            default_timeout_ms: 10_000,
        }
    }
}

fn overlay(target: &mut TaskOptions, layer: Option<&Value>) {
    if let Some(Value::Object(layer)) = layer {
        for (key, value) in layer {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn scheduler_hint(options: &TaskOptions, key: &str) -> Option<i64> {
    options
        .get(SCHEDULER_OVERRIDES_OPTION)
        .and_then(|overrides| overrides.get(key))
        .and_then(Value::as_i64)
}

/// Build a runnable instance from a definition.
///
/// Options are merged lowest to highest: task-definition defaults, graph
/// `options.defaults`, graph `options[label]`, node `optionOverrides`, run
/// `defaults`, run `[label]`.
pub fn build(
    definition: &GraphDefinition,
    catalog: &TaskCatalog,
    options: &BuildOptions,
) -> Result<GraphInstance, ValidationError> {
    validate(definition, catalog)?;

    let instance_id = options
        .instance_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let task_ids: HashMap<&str, String> = definition
        .tasks
        .iter()
        .map(|node| (node.label.as_str(), Uuid::new_v4().to_string()))
        .collect();

    let edge = |label: &str, predicate| WaitEdge {
        task_id: task_ids.get(label).cloned().unwrap_or_default(),
        label: label.to_string(),
        predicate,
    };

    let mut tasks = BTreeMap::new();
    for node in &definition.tasks {
        let resolved = catalog.resolve(&node.label, node_definition(node, catalog)?)?;

        let mut merged = resolved.options;
        overlay(&mut merged, definition.options.get(DEFAULTS_KEY));
        overlay(&mut merged, definition.options.get(&node.label));
        for (key, value) in &node.option_overrides {
            merged.insert(key.clone(), value.clone());
        }
        overlay(&mut merged, options.options.get(DEFAULTS_KEY));
        overlay(&mut merged, options.options.get(&node.label));

        if let Some(option) = resolved
            .required_options
            .iter()
            .find(|option| !merged.contains_key(option.as_str()))
        {
            return Err(ValidationError::MissingOption {
                label: node.label.clone(),
                option: option.clone(),
            });
        }

        let timeout_ms = merged
            .get(TASK_TIMEOUT_OPTION)
            .and_then(Value::as_i64)
            .or_else(|| scheduler_hint(&merged, "timeout"))
            .unwrap_or(options.default_timeout_ms);
        let retries_allowed = scheduler_hint(&merged, "retries")
            .map(|retries| u32::try_from(retries.max(0)).unwrap_or(u32::MAX))
            .unwrap_or(0);

        let waiting_on = node
            .wait_on
            .iter()
            .map(|(key, value)| match value {
                WaitOnValue::Group(group) if key == ANY_OF_KEY => WaitRequirement::AnyOf {
                    edges: group
                        .iter()
                        .map(|(label, predicate)| edge(label.as_str(), *predicate))
                        .collect(),
                },
                WaitOnValue::Predicate(predicate) => {
                    WaitRequirement::Edge(edge(key.as_str(), *predicate))
                }
                // rejected by validate
                WaitOnValue::Group(_) => WaitRequirement::AnyOf { edges: Vec::new() },
            })
            .collect();

        let task = TaskInstance {
            task_id: task_ids
                .get(node.label.as_str())
                .cloned()
                .unwrap_or_default(),
            graph_id: instance_id.clone(),
            label: node.label.clone(),
            domain: options.domain.clone(),
            injectable_name: resolved.injectable_name,
            run_job: resolved.run_job,
            state: TaskState::Pending,
            attempt: 0,
            retries_attempted: 0,
            retries_allowed,
            timeout_ms,
            ignore_failure: node.ignore_failure,
            waiting_on,
            options: merged,
            started_at: None,
            finished_at: None,
            detail: None,
        };
        tasks.insert(node.label.clone(), task);
    }

    Ok(GraphInstance {
        context: json!({
            "graphId": instance_id,
            "graphName": definition.injectable_name,
            "target": options.target,
        }),
        instance_id,
        injectable_name: definition.injectable_name.clone(),
        target: options.target.clone(),
        domain: options.domain.clone(),
        status: GraphStatus::Pending,
        service_graph: definition.service_graph,
        definition: definition.clone(),
        tasks,
        created_at: Utc::now(),
        completed_at: None,
    })
}
