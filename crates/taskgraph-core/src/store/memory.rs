// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store.
//!
//! All state lives behind one async mutex, so every conditional update is
//! trivially atomic. Suitable for single-process deployments and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    CompletedTaskRecord, FinishedTask, Lease, Store, TaskEventAction, TaskEventRecord,
};
use crate::error::{Error, Result};
use crate::graph::{
    GraphDefinition, GraphInstance, GraphStatus, TaskDefinition, TaskInstance, TaskState,
};

#[derive(Default)]
struct State {
    task_definitions: BTreeMap<String, TaskDefinition>,
    graph_definitions: BTreeMap<String, GraphDefinition>,
    graphs: HashMap<String, GraphInstance>,
    /// task id -> (graph id, label)
    task_index: HashMap<String, (String, String)>,
    completed: Vec<CompletedTaskRecord>,
    next_completed_id: i64,
    leases: HashMap<String, Lease>,
    events: Vec<TaskEventRecord>,
    last_event_id: i64,
}

impl State {
    fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskInstance> {
        let (graph_id, label) = self.task_index.get(task_id)?;
        self.graphs.get_mut(graph_id)?.tasks.get_mut(label)
    }

    fn task(&self, task_id: &str) -> Option<&TaskInstance> {
        let (graph_id, label) = self.task_index.get(task_id)?;
        self.graphs.get(graph_id)?.tasks.get(label)
    }

    fn active_for_target(&self, target: &str) -> Option<&GraphInstance> {
        self.graphs
            .values()
            .find(|g| g.target.as_deref() == Some(target) && !g.status.is_terminal())
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put_task_definition(&self, definition: &TaskDefinition) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .task_definitions
            .insert(definition.injectable_name.clone(), definition.clone());
        Ok(())
    }

    async fn get_task_definitions(&self) -> Result<Vec<TaskDefinition>> {
        let state = self.state.lock().await;
        Ok(state.task_definitions.values().cloned().collect())
    }

    async fn delete_task_definition(&self, injectable_name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.task_definitions.remove(injectable_name).is_some())
    }

    async fn put_graph_definition(&self, definition: &GraphDefinition) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .graph_definitions
            .insert(definition.injectable_name.clone(), definition.clone());
        Ok(())
    }

    async fn get_graph_definitions(&self) -> Result<Vec<GraphDefinition>> {
        let state = self.state.lock().await;
        Ok(state.graph_definitions.values().cloned().collect())
    }

    async fn delete_graph_definition(&self, injectable_name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.graph_definitions.remove(injectable_name).is_some())
    }

    async fn insert_graph(&self, graph: &GraphInstance) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(target) = &graph.target
            && let Some(existing) = state.active_for_target(target)
        {
            return Err(Error::DuplicateActiveGraph {
                target: target.clone(),
                instance_id: existing.instance_id.clone(),
            });
        }
        for (label, task) in &graph.tasks {
            state.task_index.insert(
                task.task_id.clone(),
                (graph.instance_id.clone(), label.clone()),
            );
        }
        state.graphs.insert(graph.instance_id.clone(), graph.clone());
        Ok(())
    }

    async fn get_graph(&self, instance_id: &str) -> Result<Option<GraphInstance>> {
        let state = self.state.lock().await;
        Ok(state.graphs.get(instance_id).cloned())
    }

    async fn get_graph_status(&self, instance_id: &str) -> Result<Option<GraphStatus>> {
        let state = self.state.lock().await;
        Ok(state.graphs.get(instance_id).map(|g| g.status))
    }

    async fn find_active_graph_for_target(&self, target: &str) -> Result<Option<GraphInstance>> {
        let state = self.state.lock().await;
        Ok(state.active_for_target(target).cloned())
    }

    async fn find_active_graphs(&self) -> Result<Vec<GraphInstance>> {
        let state = self.state.lock().await;
        let mut graphs: Vec<GraphInstance> = state
            .graphs
            .values()
            .filter(|g| !g.status.is_terminal())
            .cloned()
            .collect();
        graphs.sort_by_key(|g| g.created_at);
        Ok(graphs)
    }

    async fn find_running_graphs(&self, domain: &str) -> Result<Vec<GraphInstance>> {
        let state = self.state.lock().await;
        let mut graphs: Vec<GraphInstance> = state
            .graphs
            .values()
            .filter(|g| g.domain == domain && g.status == GraphStatus::Running)
            .cloned()
            .collect();
        graphs.sort_by_key(|g| g.created_at);
        Ok(graphs)
    }

    async fn find_service_graphs(&self) -> Result<Vec<GraphInstance>> {
        let state = self.state.lock().await;
        let mut graphs: Vec<GraphInstance> = state
            .graphs
            .values()
            .filter(|g| g.service_graph)
            .cloned()
            .collect();
        graphs.sort_by_key(|g| g.created_at);
        Ok(graphs)
    }

    async fn set_graph_done(
        &self,
        instance_id: &str,
        status: GraphStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.graphs.get_mut(instance_id) {
            Some(graph) if graph.status == GraphStatus::Running => {
                graph.status = status;
                graph.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_graph(&self, instance_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(graph) = state.graphs.remove(instance_id) else {
            return Ok(false);
        };
        for task in graph.tasks.values() {
            state.task_index.remove(&task.task_id);
            state.leases.remove(&task.task_id);
        }
        state.completed.retain(|row| row.graph_id != instance_id);
        Ok(true)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskInstance>> {
        let state = self.state.lock().await;
        Ok(state.task(task_id).cloned())
    }

    async fn transition_task(
        &self,
        task_id: &str,
        attempt: u32,
        from: &[TaskState],
        to: TaskState,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.task_mut(task_id) {
            Some(task) if task.attempt == attempt && from.contains(&task.state) => {
                task.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_dispatched(
        &self,
        task_id: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.task_mut(task_id) {
            Some(task) if task.attempt == attempt && task.state == TaskState::Leased => {
                task.state = TaskState::Dispatched;
                task.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reoffer_task(&self, task_id: &str, attempt: u32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.task_mut(task_id) {
            Some(task) if task.attempt == attempt && task.state.is_in_flight() => {
                task.state = TaskState::Ready;
                task.attempt += 1;
                task.started_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_task(&self, task_id: &str, attempt: u32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.task_mut(task_id) {
            Some(task) if task.attempt == attempt && !task.state.is_terminal() => {
                task.state = TaskState::Pending;
                task.attempt += 1;
                task.retries_attempted += 1;
                task.started_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_task(&self, finished: &FinishedTask) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.task_mut(&finished.task_id) {
            Some(task) if task.attempt == finished.attempt && !task.state.is_terminal() => {
                task.state = finished.state;
                task.detail = finished.detail.clone();
                task.finished_at = Some(finished.finished_at);
                if finished.started_at.is_some() {
                    task.started_at = finished.started_at;
                }
            }
            _ => return Ok(false),
        }

        state.next_completed_id += 1;
        let id = state.next_completed_id;
        state.completed.push(CompletedTaskRecord {
            id,
            task_id: finished.task_id.clone(),
            graph_id: finished.graph_id.clone(),
            domain: finished.domain.clone(),
            state: finished.state,
            created_at: finished.finished_at,
        });
        Ok(true)
    }

    async fn find_completed_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<CompletedTaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .completed
            .iter()
            .filter(|row| row.domain == domain)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_completed_tasks(&self, ids: &[i64]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.completed.len();
        state.completed.retain(|row| !ids.contains(&row.id));
        Ok((before - state.completed.len()) as u64)
    }

    async fn acquire_lease(&self, lease: &Lease) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.leases.get(&lease.task_id)
            && existing.is_valid_at(lease.acquired_at)
        {
            return Ok(false);
        }
        state.leases.insert(lease.task_id.clone(), lease.clone());
        Ok(true)
    }

    async fn renew_lease(
        &self,
        task_id: &str,
        scheduler_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(task_id) {
            Some(lease) if lease.scheduler_id == scheduler_id => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.leases.remove(task_id).is_some())
    }

    async fn get_lease(&self, task_id: &str) -> Result<Option<Lease>> {
        let state = self.state.lock().await;
        Ok(state.leases.get(task_id).cloned())
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lease>> {
        let state = self.state.lock().await;
        let mut expired: Vec<Lease> = state
            .leases
            .values()
            .filter(|lease| !lease.is_valid_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|lease| lease.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn expire_lease(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get(task_id) {
            Some(lease) if !lease.is_valid_at(now) => {
                state.leases.remove(task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_task_event(
        &self,
        action: TaskEventAction,
        routing_key: &str,
        payload: &Value,
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.last_event_id += 1;
        let id = state.last_event_id;
        state.events.push(TaskEventRecord {
            id,
            action,
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn latest_task_event_id(&self) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.last_event_id)
    }

    async fn find_task_events(
        &self,
        action: TaskEventAction,
        routing_key: Option<&str>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TaskEventRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.id > after_id && e.action == action)
            .filter(|e| routing_key.is_none_or(|key| e.routing_key == key))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune_task_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|e| e.created_at >= older_than);
        Ok((before - state.events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildOptions, GraphTaskNode, TaskCatalog, WaitPredicate, build};
    use chrono::Duration;
    use serde_json::json;

    fn sample_graph() -> GraphInstance {
        let catalog = TaskCatalog::from_definitions([TaskDefinition::base("Task.Noop", "noop")]);
        let def = GraphDefinition::new("Graph.Pair")
            .task(GraphTaskNode::new("a", "Task.Noop"))
            .task(GraphTaskNode::new("b", "Task.Noop").wait_on("a", WaitPredicate::Succeeded));
        let mut graph = build(&def, &catalog, &BuildOptions::default()).unwrap();
        graph.status = GraphStatus::Running;
        graph
    }

    fn finished(task: &TaskInstance, state: TaskState) -> FinishedTask {
        FinishedTask {
            task_id: task.task_id.clone(),
            graph_id: task.graph_id.clone(),
            domain: task.domain.clone(),
            attempt: task.attempt,
            state,
            detail: Some(json!({ "ok": true })),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_transitions_are_attempt_guarded() {
        let store = MemoryStore::new();
        let graph = sample_graph();
        store.insert_graph(&graph).await.unwrap();
        let a = graph.tasks["a"].clone();

        assert!(!store
            .transition_task(&a.task_id, 1, &[TaskState::Pending], TaskState::Ready)
            .await
            .unwrap());
        assert!(store
            .transition_task(&a.task_id, 0, &[TaskState::Pending], TaskState::Ready)
            .await
            .unwrap());
        assert!(!store
            .transition_task(&a.task_id, 0, &[TaskState::Pending], TaskState::Ready)
            .await
            .unwrap());

        let stored = store.get_task(&a.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Ready);
    }

    #[tokio::test]
    async fn test_finish_task_writes_once() {
        let store = MemoryStore::new();
        let graph = sample_graph();
        store.insert_graph(&graph).await.unwrap();
        let a = graph.tasks["a"].clone();

        assert!(store.finish_task(&finished(&a, TaskState::Succeeded)).await.unwrap());
        assert!(!store.finish_task(&finished(&a, TaskState::Failed)).await.unwrap());

        let rows = store.find_completed_tasks("default", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, TaskState::Succeeded);

        let reloaded = store.get_graph(&graph.instance_id).await.unwrap().unwrap();
        assert_eq!(reloaded.tasks["a"].state, TaskState::Succeeded);
        assert_eq!(reloaded.tasks["a"].detail, Some(json!({ "ok": true })));

        assert_eq!(store.delete_completed_tasks(&[rows[0].id]).await.unwrap(), 1);
        assert!(store.find_completed_tasks("default", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_and_reoffer_bump_attempt() {
        let store = MemoryStore::new();
        let graph = sample_graph();
        store.insert_graph(&graph).await.unwrap();
        let a = &graph.tasks["a"];

        store
            .transition_task(&a.task_id, 0, &[TaskState::Pending], TaskState::Leased)
            .await
            .unwrap();
        assert!(store.reoffer_task(&a.task_id, 0).await.unwrap());
        let task = store.get_task(&a.task_id).await.unwrap().unwrap();
        assert_eq!((task.state, task.attempt), (TaskState::Ready, 1));

        assert!(store.retry_task(&a.task_id, 1).await.unwrap());
        let task = store.get_task(&a.task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt, 2);
        assert_eq!(task.retries_attempted, 1);

        // stale attempt
        assert!(!store.retry_task(&a.task_id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Lease::new("t1", "s1", now, Duration::seconds(10));
        let second = Lease::new("t1", "s2", now + Duration::seconds(1), Duration::seconds(10));

        assert!(store.acquire_lease(&first).await.unwrap());
        assert!(!store.acquire_lease(&second).await.unwrap());
        assert!(!store.renew_lease("t1", "s2", now).await.unwrap());

        let later = Lease::new("t1", "s2", now + Duration::seconds(11), Duration::seconds(10));
        assert!(store.acquire_lease(&later).await.unwrap());
        assert_eq!(store.get_lease("t1").await.unwrap().unwrap().scheduler_id, "s2");
    }

    #[tokio::test]
    async fn test_expire_lease_is_conditional() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .acquire_lease(&Lease::new("t1", "s1", now, Duration::seconds(5)))
            .await
            .unwrap();

        assert!(store.find_expired_leases(now, 10).await.unwrap().is_empty());
        let later = now + Duration::seconds(6);
        assert_eq!(store.find_expired_leases(later, 10).await.unwrap().len(), 1);

        // renewed in between
        store
            .renew_lease("t1", "s1", now + Duration::seconds(60))
            .await
            .unwrap();
        assert!(!store.expire_lease("t1", later).await.unwrap());
        assert!(store.get_lease("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_graph_done_once() {
        let store = MemoryStore::new();
        let graph = sample_graph();
        store.insert_graph(&graph).await.unwrap();

        let now = Utc::now();
        assert!(store
            .set_graph_done(&graph.instance_id, GraphStatus::Succeeded, now)
            .await
            .unwrap());
        assert!(!store
            .set_graph_done(&graph.instance_id, GraphStatus::Failed, now)
            .await
            .unwrap());
        assert!(store.find_running_graphs("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_live_graph_per_target() {
        let store = MemoryStore::new();
        let mut first = sample_graph();
        first.target = Some("node-1".to_string());
        store.insert_graph(&first).await.unwrap();

        let mut second = sample_graph();
        second.target = Some("node-1".to_string());
        let err = store.insert_graph(&second).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateActiveGraph { ref instance_id, .. } if *instance_id == first.instance_id
        ));
        assert!(store.get_graph(&second.instance_id).await.unwrap().is_none());
        assert_eq!(
            store
                .find_active_graph_for_target("node-1")
                .await
                .unwrap()
                .map(|g| g.instance_id),
            Some(first.instance_id.clone())
        );

        store
            .set_graph_done(&first.instance_id, GraphStatus::Succeeded, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.get_graph_status(&first.instance_id).await.unwrap(),
            Some(GraphStatus::Succeeded)
        );
        assert!(store.find_active_graph_for_target("node-1").await.unwrap().is_none());
        store.insert_graph(&second).await.unwrap();
        assert_eq!(store.find_active_graphs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_sequence_monotonic() {
        let store = MemoryStore::new();
        for n in 0..3 {
            store
                .append_task_event(TaskEventAction::Run, "lab", &json!({ "n": n }))
                .await
                .unwrap();
        }
        let cursor = store.latest_task_event_id().await.unwrap();

        let pruned = store
            .prune_task_events(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 3);
        assert_eq!(store.latest_task_event_id().await.unwrap(), cursor);

        let id = store
            .append_task_event(TaskEventAction::Run, "lab", &json!({ "n": 3 }))
            .await
            .unwrap();
        assert_eq!(id, cursor + 1);
        let events = store
            .find_task_events(TaskEventAction::Run, Some("lab"), cursor, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["n"], 3);
    }

    #[tokio::test]
    async fn test_task_event_log_filters() {
        let store = MemoryStore::new();
        store
            .append_task_event(TaskEventAction::Run, "lab", &json!({ "n": 1 }))
            .await
            .unwrap();
        let cursor = store.latest_task_event_id().await.unwrap();
        store
            .append_task_event(TaskEventAction::Run, "lab", &json!({ "n": 2 }))
            .await
            .unwrap();
        store
            .append_task_event(TaskEventAction::Run, "other", &json!({ "n": 3 }))
            .await
            .unwrap();

        let events = store
            .find_task_events(TaskEventAction::Run, Some("lab"), cursor, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["n"], 2);

        let all = store
            .find_task_events(TaskEventAction::Run, None, 0, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }
}
