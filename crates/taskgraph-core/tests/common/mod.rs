// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for taskgraph-core integration tests.
//!
//! Provides store/messenger constructors, the diamond graph fixture and a
//! scriptable task kind.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use taskgraph_core::graph::{
    GraphDefinition, GraphTaskNode, SCHEDULER_OVERRIDES_OPTION, TaskDefinition, WaitPredicate,
};
use taskgraph_core::manifest::DefinitionManifest;
use taskgraph_core::messenger::{BrokerMessenger, Messenger, StorageMessenger};
use taskgraph_core::registry::Registry;
use taskgraph_core::runner::{TaskContext, TaskError, TaskKind};
use taskgraph_core::store::{MemoryStore, SqliteStore, Store};

/// Fresh in-memory store.
pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

/// Fresh migrated SQLite store on a private in-memory database.
pub async fn sqlite_store() -> Arc<dyn Store> {
    Arc::new(
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory SQLite store"),
    )
}

/// In-process broker messenger.
pub fn broker() -> Arc<dyn Messenger> {
    Arc::new(BrokerMessenger::default())
}

/// Storage-poll messenger with a short poll interval.
pub fn storage_messenger(store: Arc<dyn Store>) -> Arc<dyn Messenger> {
    Arc::new(StorageMessenger::new(store, Duration::from_millis(10)))
}

/// Definitions used across the tests: the built-ins plus `Task.Script`
/// (run by [`ScriptKind`]) and the diamond graph.
pub fn test_manifest() -> DefinitionManifest {
    DefinitionManifest::builtin().merge(DefinitionManifest {
        base_tasks: vec![TaskDefinition::base("Task.Base.Script", "script")],
        tasks: vec![TaskDefinition::implementing("Task.Script", "Task.Base.Script")],
        graphs: vec![diamond_definition()],
    })
}

/// Registry over `store`, loaded with [`test_manifest`].
pub async fn registry(store: Arc<dyn Store>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new(store));
    registry
        .load(&test_manifest())
        .await
        .expect("Failed to load test manifest");
    registry
}

/// `A → {B, C} → D`; B and C wait on A:succeeded, D on B and C succeeded.
pub fn diamond_definition() -> GraphDefinition {
    GraphDefinition::new("Graph.Diamond")
        .task(GraphTaskNode::new("A", "Task.Script"))
        .task(GraphTaskNode::new("B", "Task.Script").wait_on("A", WaitPredicate::Succeeded))
        .task(GraphTaskNode::new("C", "Task.Script").wait_on("A", WaitPredicate::Succeeded))
        .task(
            GraphTaskNode::new("D", "Task.Script")
                .wait_on("B", WaitPredicate::Succeeded)
                .wait_on("C", WaitPredicate::Succeeded),
        )
}

/// Node with scheduler hints in its option overrides.
pub fn with_scheduler_overrides(mut node: GraphTaskNode, overrides: Value) -> GraphTaskNode {
    node.option_overrides
        .insert(SCHEDULER_OVERRIDES_OPTION.to_string(), overrides);
    node
}

/// Task kind driven by its options:
///
/// - `fail: true` fails the task,
/// - `failAttempts: n` fails attempts below `n`,
/// - `sleepMs: n` sleeps first (stopping early on cancellation).
pub struct ScriptKind;

#[async_trait]
impl TaskKind for ScriptKind {
    fn name(&self) -> &str {
        "script"
    }

    async fn execute(
        &self,
        options: &taskgraph_core::graph::TaskOptions,
        context: &TaskContext,
    ) -> Result<Option<Value>, TaskError> {
        if let Some(sleep_ms) = options.get("sleepMs").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                _ = context.cancellation.cancelled() => {
                    return Err(TaskError::Failed("interrupted".to_string()));
                }
            }
        }
        if options.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(TaskError::Failed(format!("{} told to fail", context.label)));
        }
        let fail_attempts = options
            .get("failAttempts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if u64::from(context.attempt) < fail_attempts {
            return Err(TaskError::Failed(format!("attempt {}", context.attempt)));
        }
        Ok(Some(json!({ "label": context.label, "attempt": context.attempt })))
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
