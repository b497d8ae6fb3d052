// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Definition catalogs and the active-graph index.
//!
//! The [`Registry`] is an explicit value shared as `Arc<Registry>`. It holds:
//!
//! - base task definitions (from manifests, memory only),
//! - task and graph definitions (manifest + store, persisted on change),
//! - the index of live graphs, keyed by instance id and by target.
//!
//! At most one live graph may be bound to a target. The store enforces this
//! across processes; the index repeats the check under one map entry so two
//! local callers never both reach the store. The index is a cache of the
//! store: [`Registry::load`] fills it from the running graphs, and
//! [`Registry::sync_active_graphs`] drops entries another process finalized.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::graph::{
    BuildOptions, GraphDefinition, GraphInstance, GraphStatus, TaskCatalog, TaskDefinition, build,
    validate,
};
use crate::manifest::DefinitionManifest;
use crate::store::Store;

/// Summary of a live graph held in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveGraph {
    /// Instance id.
    pub instance_id: String,
    /// Definition name.
    pub injectable_name: String,
    /// Bound target, if any.
    pub target: Option<String>,
    /// Scheduling domain.
    pub domain: String,
    /// Service graph flag.
    pub service_graph: bool,
}

/// Lookup keys for [`Registry::fetch_active_graph_sync`].
#[derive(Debug, Clone, Default)]
pub struct ActiveGraphFilter {
    /// Match by bound target.
    pub target: Option<String>,
    /// Match by instance id.
    pub instance_id: Option<String>,
}

impl ActiveGraphFilter {
    /// Filter by target.
    pub fn target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            instance_id: None,
        }
    }

    /// Filter by instance id.
    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            target: None,
            instance_id: Some(instance_id.into()),
        }
    }
}

/// Resolves once when the graph leaves the active index.
///
/// Yields the final status, or `None` if the registry was dropped first.
#[must_use = "a completion does nothing unless awaited"]
#[derive(Debug)]
pub struct GraphCompletion {
    instance_id: String,
    rx: oneshot::Receiver<GraphStatus>,
}

impl GraphCompletion {
    /// Instance this completion belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Future for GraphCompletion {
    type Output = Option<GraphStatus>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.ok())
    }
}

struct ActiveEntry {
    graph: ActiveGraph,
    completion: oneshot::Sender<GraphStatus>,
}

/// Definitions plus live graphs.
pub struct Registry {
    store: Arc<dyn Store>,
    base_tasks: DashMap<String, TaskDefinition>,
    tasks: DashMap<String, TaskDefinition>,
    graphs: DashMap<String, GraphDefinition>,
    active: DashMap<String, ActiveEntry>,
    by_target: DashMap<String, String>,
}

fn check_task(definition: &TaskDefinition) -> Result<()> {
    if definition.injectable_name.trim().is_empty() {
        return Err(Error::MissingField {
            field: "injectableName",
        });
    }
    if definition.run_job.is_none() && definition.implements_task.is_none() {
        return Err(Error::MissingField {
            field: "implementsTask",
        });
    }
    Ok(())
}

fn check_graph(definition: &GraphDefinition) -> Result<()> {
    if definition.injectable_name.trim().is_empty() {
        return Err(Error::MissingField {
            field: "injectableName",
        });
    }
    if definition.tasks.is_empty() {
        return Err(Error::MissingField { field: "tasks" });
    }
    Ok(())
}

impl Registry {
    /// Empty registry persisting through `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            base_tasks: DashMap::new(),
            tasks: DashMap::new(),
            graphs: DashMap::new(),
            active: DashMap::new(),
            by_target: DashMap::new(),
        }
    }

    /// Register a manifest, then overlay the store's copies.
    ///
    /// Persisted definitions win over manifest entries of the same name;
    /// manifest entries the store does not know yet are persisted.
    pub async fn load(&self, manifest: &DefinitionManifest) -> Result<()> {
        for base in &manifest.base_tasks {
            check_task(base)?;
            self.base_tasks
                .insert(base.injectable_name.clone(), base.clone());
        }

        let persisted_tasks = self.store.get_task_definitions().await?;
        let known: HashSet<String> = persisted_tasks
            .iter()
            .map(|t| t.injectable_name.clone())
            .collect();
        for task in &manifest.tasks {
            check_task(task)?;
            if !known.contains(&task.injectable_name) {
                self.store.put_task_definition(task).await?;
            }
            self.tasks.insert(task.injectable_name.clone(), task.clone());
        }
        for task in persisted_tasks {
            self.tasks.insert(task.injectable_name.clone(), task);
        }

        let persisted_graphs = self.store.get_graph_definitions().await?;
        let known: HashSet<String> = persisted_graphs
            .iter()
            .map(|g| g.injectable_name.clone())
            .collect();
        let catalog = self.task_catalog();
        for graph in &manifest.graphs {
            if known.contains(&graph.injectable_name) {
                continue;
            }
            check_graph(graph)?;
            validate(graph, &catalog)?;
            self.store.put_graph_definition(graph).await?;
            self.graphs
                .insert(graph.injectable_name.clone(), graph.clone());
        }
        for graph in persisted_graphs {
            self.graphs.insert(graph.injectable_name.clone(), graph);
        }

        let mut indexed = 0;
        for graph in self.store.find_active_graphs().await? {
            if self.active.contains_key(&graph.instance_id) {
                continue;
            }
            match self.put_active_graph_sync(&graph) {
                Ok(_) => indexed += 1,
                Err(e) => warn!(graph_id = %graph.instance_id, error = %e, "Live graph not indexed"),
            }
        }

        info!(
            base_tasks = self.base_tasks.len(),
            tasks = self.tasks.len(),
            graphs = self.graphs.len(),
            active_graphs = indexed,
            "Registry loaded"
        );
        Ok(())
    }

    /// Upsert a task definition.
    pub async fn register_task(&self, definition: TaskDefinition) -> Result<()> {
        check_task(&definition)?;
        self.store.put_task_definition(&definition).await?;
        debug!(task = %definition.injectable_name, "Task definition registered");
        self.tasks
            .insert(definition.injectable_name.clone(), definition);
        Ok(())
    }

    /// Validate and upsert a graph definition.
    pub async fn register_graph(&self, definition: GraphDefinition) -> Result<()> {
        check_graph(&definition)?;
        validate(&definition, &self.task_catalog())?;
        self.store.put_graph_definition(&definition).await?;
        debug!(graph = %definition.injectable_name, "Graph definition registered");
        self.graphs
            .insert(definition.injectable_name.clone(), definition);
        Ok(())
    }

    /// Drop a task definition. Returns whether it was known.
    pub async fn remove_task(&self, injectable_name: &str) -> Result<bool> {
        let persisted = self.store.delete_task_definition(injectable_name).await?;
        Ok(self.tasks.remove(injectable_name).is_some() || persisted)
    }

    /// Drop a graph definition. Returns whether it was known.
    pub async fn remove_graph(&self, injectable_name: &str) -> Result<bool> {
        let persisted = self.store.delete_graph_definition(injectable_name).await?;
        Ok(self.graphs.remove(injectable_name).is_some() || persisted)
    }

    /// Snapshot of every task definition graphs may reference.
    pub fn task_catalog(&self) -> TaskCatalog {
        TaskCatalog::from_definitions(
            self.base_tasks
                .iter()
                .map(|entry| entry.value().clone())
                .chain(self.tasks.iter().map(|entry| entry.value().clone())),
        )
    }

    /// Base and registered task definitions, sorted by name.
    pub fn fetch_task_definition_catalog(&self) -> Vec<TaskDefinition> {
        let mut definitions: Vec<TaskDefinition> = self
            .base_tasks
            .iter()
            .filter(|entry| !self.tasks.contains_key(entry.key()))
            .map(|entry| entry.value().clone())
            .chain(self.tasks.iter().map(|entry| entry.value().clone()))
            .collect();
        definitions.sort_by(|a, b| a.injectable_name.cmp(&b.injectable_name));
        definitions
    }

    /// Every graph definition, sorted by name.
    pub fn fetch_graph_definition_catalog(&self) -> Vec<GraphDefinition> {
        let mut definitions: Vec<GraphDefinition> = self
            .graphs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        definitions.sort_by(|a, b| a.injectable_name.cmp(&b.injectable_name));
        definitions
    }

    /// One graph definition.
    pub fn fetch_graph_definition(&self, injectable_name: &str) -> Option<GraphDefinition> {
        self.graphs
            .get(injectable_name)
            .map(|entry| entry.value().clone())
    }

    /// Build, index and persist a running instance of a graph definition.
    pub async fn create_graph(
        &self,
        injectable_name: &str,
        options: BuildOptions,
    ) -> Result<(GraphInstance, GraphCompletion)> {
        let definition = self
            .fetch_graph_definition(injectable_name)
            .ok_or_else(|| Error::GraphNotFound(injectable_name.to_string()))?;

        let mut graph = build(&definition, &self.task_catalog(), &options)?;
        graph.status = GraphStatus::Running;

        if let Some(target) = &graph.target {
            self.release_finished_target(target).await?;
        }
        let completion = self.put_active_graph_sync(&graph)?;
        if let Err(e) = self.store.insert_graph(&graph).await {
            self.discard_active_graph(&graph.instance_id);
            return Err(e);
        }

        info!(
            graph_id = %graph.instance_id,
            graph = %graph.injectable_name,
            target = ?graph.target,
            domain = %graph.domain,
            tasks = graph.tasks.len(),
            "Graph created"
        );
        Ok((graph, completion))
    }

    /// The live graph bound to `target` according to the store.
    ///
    /// Indexes a graph created by another process and drops a local entry
    /// whose graph has since been finalized.
    pub async fn find_active_graph(&self, target: &str) -> Result<Option<ActiveGraph>> {
        self.release_finished_target(target).await?;
        let Some(graph) = self.store.find_active_graph_for_target(target).await? else {
            return Ok(None);
        };
        if !self.active.contains_key(&graph.instance_id) {
            // a completion nobody awaits; the graph was created elsewhere
            let _ = self.put_active_graph_sync(&graph);
        }
        Ok(Some(summarize(&graph)))
    }

    /// Complete every indexed graph the store already shows as finalized.
    ///
    /// Covers graphs finalized by a poller holding another registry. Returns
    /// how many entries were completed.
    pub async fn sync_active_graphs(&self) -> Result<usize> {
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        let mut completed = 0;
        for instance_id in ids {
            if let Some(status) = self.store.get_graph_status(&instance_id).await?
                && status.is_terminal()
                && self.complete_active_graph(&instance_id, status)
            {
                debug!(graph_id = %instance_id, status = %status, "Graph finalized elsewhere");
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn release_finished_target(&self, target: &str) -> Result<()> {
        let Some(bound) = self.by_target.get(target).map(|entry| entry.value().clone()) else {
            return Ok(());
        };
        // an entry the store does not know yet belongs to a create in progress
        if let Some(status) = self.store.get_graph_status(&bound).await?
            && status.is_terminal()
        {
            self.complete_active_graph(&bound, status);
        }
        Ok(())
    }

    /// Add a graph to the active index.
    ///
    /// Fails with [`Error::DuplicateActiveGraph`] when the graph's target is
    /// already bound; nothing is changed in that case.
    pub fn put_active_graph_sync(&self, graph: &GraphInstance) -> Result<GraphCompletion> {
        if let Some(target) = &graph.target {
            match self.by_target.entry(target.clone()) {
                Entry::Occupied(existing) => {
                    return Err(Error::DuplicateActiveGraph {
                        target: target.clone(),
                        instance_id: existing.get().clone(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(graph.instance_id.clone());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.active.insert(
            graph.instance_id.clone(),
            ActiveEntry {
                graph: summarize(graph),
                completion: tx,
            },
        );

        Ok(GraphCompletion {
            instance_id: graph.instance_id.clone(),
            rx,
        })
    }

    /// Look up a live graph by target or instance id.
    ///
    /// Target takes precedence; `None` when neither key is given.
    pub fn fetch_active_graph_sync(&self, filter: &ActiveGraphFilter) -> Option<ActiveGraph> {
        let instance_id = match (&filter.target, &filter.instance_id) {
            (Some(target), _) => self.by_target.get(target)?.value().clone(),
            (None, Some(instance_id)) => instance_id.clone(),
            (None, None) => return None,
        };
        self.active
            .get(&instance_id)
            .map(|entry| entry.graph.clone())
    }

    /// Every live graph.
    pub fn fetch_active_graphs_sync(&self) -> Vec<ActiveGraph> {
        self.active
            .iter()
            .map(|entry| entry.graph.clone())
            .collect()
    }

    /// Remove a finished graph from the index and resolve its completion.
    ///
    /// Returns `false` if the graph was not indexed (already completed).
    pub fn complete_active_graph(&self, instance_id: &str, status: GraphStatus) -> bool {
        let Some((_, entry)) = self.active.remove(instance_id) else {
            return false;
        };
        if let Some(target) = &entry.graph.target {
            self.by_target
                .remove_if(target, |_, bound| bound == instance_id);
        }
        // receiver may have been dropped
        let _ = entry.completion.send(status);
        true
    }

    /// Remove a graph that was cancelled or deleted; its completion resolves
    /// as `cancelled`.
    pub fn remove_active_graph(&self, instance_id: &str) -> bool {
        self.complete_active_graph(instance_id, GraphStatus::Cancelled)
    }

    /// Unindex a graph that never reached the store.
    fn discard_active_graph(&self, instance_id: &str) {
        if let Some((_, entry)) = self.active.remove(instance_id)
            && let Some(target) = &entry.graph.target
        {
            self.by_target
                .remove_if(target, |_, bound| bound == instance_id);
        }
    }
}

fn summarize(graph: &GraphInstance) -> ActiveGraph {
    ActiveGraph {
        instance_id: graph.instance_id.clone(),
        injectable_name: graph.injectable_name.clone(),
        target: graph.target.clone(),
        domain: graph.domain.clone(),
        service_graph: graph.service_graph,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphTaskNode, ValidationError, WaitPredicate};
    use crate::store::MemoryStore;

    fn registry() -> (Arc<dyn Store>, Registry) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (store.clone(), Registry::new(store))
    }

    async fn loaded() -> Registry {
        let (_, registry) = registry();
        registry
            .load(&DefinitionManifest::builtin())
            .await
            .unwrap();
        registry
    }

    fn targeted(target: &str) -> BuildOptions {
        BuildOptions {
            target: Some(target.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_task_upserts() {
        let (store, registry) = registry();
        let mut task = TaskDefinition::implementing("Task.testUpdate", "Task.Base.test");
        registry.register_task(task.clone()).await.unwrap();
        registry.register_task(task.clone()).await.unwrap();
        assert_eq!(registry.fetch_task_definition_catalog().len(), 1);

        task.properties = serde_json::json!({ "updateKey": "updated" });
        registry.register_task(task).await.unwrap();
        let catalog = registry.fetch_task_definition_catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].properties["updateKey"], "updated");
        assert_eq!(store.get_task_definitions().await.unwrap().len(), 1);

        assert!(registry.remove_task("Task.testUpdate").await.unwrap());
        assert!(registry.fetch_task_definition_catalog().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_missing_fields() {
        let (_, registry) = registry();
        let err = registry
            .register_task(TaskDefinition::implementing("", "Task.Base.Noop"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "injectableName" }));

        let mut orphan = TaskDefinition::implementing("Task.Orphan", "x");
        orphan.implements_task = None;
        let err = registry.register_task(orphan).await.unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "implementsTask" }));

        let err = registry
            .register_graph(GraphDefinition::new("Graph.Empty"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "tasks" }));
    }

    #[tokio::test]
    async fn test_register_graph_rejects_cycle() {
        let registry = loaded().await;
        let cyclic = GraphDefinition::new("Graph.Cycle")
            .task(GraphTaskNode::new("a", "Task.Noop").wait_on("b", WaitPredicate::Succeeded))
            .task(GraphTaskNode::new("b", "Task.Noop").wait_on("a", WaitPredicate::Succeeded));

        let err = registry.register_graph(cyclic).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::CycleDetected { .. })
        ));
        assert!(registry.fetch_graph_definition("Graph.Cycle").is_none());
    }

    #[tokio::test]
    async fn test_load_prefers_persisted_definitions() {
        let (store, registry) = registry();
        let mut persisted = GraphDefinition::new("Graph.Noop")
            .task(GraphTaskNode::new("noop", "Task.Noop"));
        persisted.friendly_name = "Edited".to_string();
        store.put_graph_definition(&persisted).await.unwrap();

        registry
            .load(&DefinitionManifest::builtin())
            .await
            .unwrap();

        let graph = registry.fetch_graph_definition("Graph.Noop").unwrap();
        assert_eq!(graph.friendly_name, "Edited");

        // manifest tasks were persisted, base tasks were not
        let stored: Vec<String> = store
            .get_task_definitions()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.injectable_name)
            .collect();
        assert_eq!(stored, vec!["Task.Noop", "Task.Sleep"]);
        assert_eq!(registry.fetch_task_definition_catalog().len(), 4);
    }

    #[tokio::test]
    async fn test_one_active_graph_per_target() {
        let registry = loaded().await;
        let (first, _completion) = registry
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .unwrap();

        let err = registry
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .unwrap_err();
        match err {
            Error::DuplicateActiveGraph {
                target,
                instance_id,
            } => {
                assert_eq!(target, "node-1");
                assert_eq!(instance_id, first.instance_id);
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(registry
            .create_graph("Graph.Noop", targeted("node-2"))
            .await
            .is_ok());
        assert_eq!(registry.fetch_active_graphs_sync().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_put_single_winner() {
        let registry = Arc::new(loaded().await);
        let definition = registry.fetch_graph_definition("Graph.Noop").unwrap();
        let catalog = registry.task_catalog();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let graph = build(&definition, &catalog, &targeted("node-x")).unwrap();
            handles.push(tokio::spawn(async move {
                registry.put_active_graph_sync(&graph).is_ok()
            }));
        }

        let wins = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_completion_fires_once_and_frees_target() {
        let registry = loaded().await;
        let (graph, completion) = registry
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .unwrap();

        let found = registry
            .fetch_active_graph_sync(&ActiveGraphFilter::target("node-1"))
            .unwrap();
        assert_eq!(found.instance_id, graph.instance_id);

        assert!(registry.complete_active_graph(&graph.instance_id, GraphStatus::Succeeded));
        assert!(!registry.complete_active_graph(&graph.instance_id, GraphStatus::Failed));
        assert_eq!(completion.await, Some(GraphStatus::Succeeded));

        assert!(registry
            .fetch_active_graph_sync(&ActiveGraphFilter::instance(&graph.instance_id))
            .is_none());
        assert!(registry
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fetch_active_graph_without_keys() {
        let registry = loaded().await;
        registry
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .unwrap();
        assert!(registry
            .fetch_active_graph_sync(&ActiveGraphFilter::default())
            .is_none());
    }

    #[tokio::test]
    async fn test_create_unknown_graph() {
        let registry = loaded().await;
        let err = registry
            .create_graph("Graph.Missing", BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GraphNotFound(name) if name == "Graph.Missing"));
    }

    #[tokio::test]
    async fn test_untargeted_graphs_do_not_conflict() {
        let registry = loaded().await;
        let (a, _) = registry
            .create_graph("Graph.Noop", BuildOptions::default())
            .await
            .unwrap();
        let (b, _) = registry
            .create_graph("Graph.Noop", BuildOptions::default())
            .await
            .unwrap();
        assert_ne!(a.instance_id, b.instance_id);
        assert!(registry.remove_active_graph(&a.instance_id));
    }
}
