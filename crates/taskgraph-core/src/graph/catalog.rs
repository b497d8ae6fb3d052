// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task-definition lookup used while validating and building graphs.

use std::collections::{HashMap, HashSet};

use super::definition::{TaskDefinition, TaskOptions};
use super::validate::ValidationError;

/// A task definition flattened along its `implementsTask` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    /// Name of the most-derived definition.
    pub injectable_name: String,
    /// Task kind to execute.
    pub run_job: String,
    /// Options merged from the base upwards.
    pub options: TaskOptions,
    /// Union of required option keys along the chain.
    pub required_options: Vec<String>,
}

/// Snapshot of the task definitions a graph may reference.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskCatalog {
    /// Build a catalog; later definitions with the same name win.
    pub fn from_definitions(definitions: impl IntoIterator<Item = TaskDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|def| (def.injectable_name.clone(), def))
                .collect(),
        }
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.get(name)
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Follow `implementsTask` until a `runJob` is found.
    ///
    /// `label` is only used to attribute errors to a graph node.
    pub fn resolve(
        &self,
        label: &str,
        definition: &TaskDefinition,
    ) -> Result<ResolvedTask, ValidationError> {
        let mut layers: Vec<&TaskOptions> = Vec::new();
        let mut required_options: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = definition;

        let run_job = loop {
            if !seen.insert(current.injectable_name.as_str()) {
                return Err(ValidationError::MissingRunJob {
                    task_name: definition.injectable_name.clone(),
                });
            }
            layers.push(&current.options);
            for option in &current.required_options {
                if !required_options.contains(option) {
                    required_options.push(option.clone());
                }
            }

            if let Some(run_job) = &current.run_job {
                break run_job.clone();
            }

            let Some(base_name) = &current.implements_task else {
                return Err(ValidationError::MissingRunJob {
                    task_name: definition.injectable_name.clone(),
                });
            };
            current = self
                .get(base_name)
                .ok_or_else(|| ValidationError::UnknownTask {
                    label: label.to_string(),
                    task_name: base_name.clone(),
                })?;
        };

        let mut options = TaskOptions::new();
        for layer in layers.into_iter().rev() {
            for (key, value) in layer {
                options.insert(key.clone(), value.clone());
            }
        }

        Ok(ResolvedTask {
            injectable_name: definition.injectable_name.clone(),
            run_job,
            options,
            required_options,
        })
    }
}
