// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Definition manifests.
//!
//! A manifest is an explicit list of definitions handed to
//! [`Registry::load`](crate::registry::Registry::load):
//!
//! ```json
//! {
//!   "baseTasks": [{ "injectableName": "Task.Base.Shell", "runJob": "shell" }],
//!   "tasks": [{ "injectableName": "Task.Shell.Reboot", "implementsTask": "Task.Base.Shell" }],
//!   "graphs": [{ "injectableName": "Graph.Reboot", "tasks": [{ "label": "reboot", "taskName": "Task.Shell.Reboot" }] }]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::graph::{GraphDefinition, GraphTaskNode, TaskDefinition};

/// Definitions to register at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionManifest {
    /// Base tasks; kept in memory only.
    #[serde(default)]
    pub base_tasks: Vec<TaskDefinition>,
    /// Task definitions; persisted unless the store already has them.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Graph definitions; persisted unless the store already has them.
    #[serde(default)]
    pub graphs: Vec<GraphDefinition>,
}

impl DefinitionManifest {
    /// Parse a manifest document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Definitions shipped with the crate: the `noop` and `sleep` kinds and
    /// `Graph.Noop`.
    pub fn builtin() -> Self {
        Self {
            base_tasks: vec![
                TaskDefinition::base("Task.Base.Noop", "noop"),
                TaskDefinition::base("Task.Base.Sleep", "sleep")
                    .with_options(json!({ "durationMs": 1000 })),
            ],
            tasks: vec![
                TaskDefinition::implementing("Task.Noop", "Task.Base.Noop"),
                TaskDefinition::implementing("Task.Sleep", "Task.Base.Sleep"),
            ],
            graphs: vec![
                GraphDefinition::new("Graph.Noop").task(GraphTaskNode::new("noop", "Task.Noop")),
            ],
        }
    }

    /// Append `other`; later entries win on name clashes.
    pub fn merge(mut self, other: DefinitionManifest) -> Self {
        self.base_tasks.extend(other.base_tasks);
        self.tasks.extend(other.tasks);
        self.graphs.extend(other.graphs);
        self
    }

    /// Total number of definitions.
    pub fn len(&self) -> usize {
        self.base_tasks.len() + self.tasks.len() + self.graphs.len()
    }

    /// No definitions at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildOptions, TaskCatalog, build};
    use std::io::Write;

    #[test]
    fn test_builtin_manifest_builds() {
        let manifest = DefinitionManifest::builtin();
        let catalog = TaskCatalog::from_definitions(
            manifest
                .base_tasks
                .iter()
                .chain(manifest.tasks.iter())
                .cloned(),
        );
        for graph in &manifest.graphs {
            build(graph, &catalog, &BuildOptions::default()).unwrap();
        }
        let sleep = catalog
            .resolve("s", catalog.get("Task.Sleep").unwrap())
            .unwrap();
        assert_eq!(sleep.run_job, "sleep");
        assert_eq!(sleep.options["durationMs"], 1000);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "tasks": [{{ "injectableName": "Task.Ping", "implementsTask": "Task.Base.Noop" }}],
                "graphs": [{{ "injectableName": "Graph.Ping", "tasks": [{{ "label": "ping", "taskName": "Task.Ping" }}] }}]
            }}"#
        )
        .unwrap();

        let manifest = DefinitionManifest::from_path(file.path()).unwrap();
        assert!(manifest.base_tasks.is_empty());
        assert_eq!(manifest.tasks[0].implements_task.as_deref(), Some("Task.Base.Noop"));
        assert_eq!(manifest.graphs[0].tasks[0].label, "ping");

        let merged = DefinitionManifest::builtin().merge(manifest);
        assert_eq!(merged.len(), 7);
    }

    #[test]
    fn test_malformed_manifest() {
        assert!(DefinitionManifest::from_json_str("{ \"tasks\": 7 }").is_err());
        assert!(DefinitionManifest::from_path("/nonexistent/manifest.json").is_err());
    }
}
