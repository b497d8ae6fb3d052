// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests running every worker through [`TaskGraphRuntime`].

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use common::ScriptKind;
use taskgraph_core::graph::{
    BuildOptions, GraphDefinition, GraphStatus, GraphTaskNode, TaskState, WaitPredicate,
};
use taskgraph_core::messenger::Messenger;
use taskgraph_core::registry::GraphCompletion;
use taskgraph_core::runtime::TaskGraphRuntime;
use taskgraph_core::store::Store;

async fn start_runtime(
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
) -> TaskGraphRuntime {
    let registry = common::registry(store.clone()).await;
    TaskGraphRuntime::builder()
        .store(store)
        .messenger(messenger)
        .registry(registry)
        .task_kind(ScriptKind)
        .poll_interval(Duration::from_millis(50))
        .service_graphs(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn run_graph(
    runtime: &TaskGraphRuntime,
    name: &str,
    run_options: Value,
) -> (String, GraphCompletion) {
    let options = BuildOptions {
        options: run_options.as_object().cloned().unwrap_or_default(),
        ..runtime.build_options()
    };
    let (graph, completion) = runtime.registry().create_graph(name, options).await.unwrap();
    (graph.instance_id, completion)
}

async fn await_completion(completion: GraphCompletion) -> GraphStatus {
    tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .expect("graph did not finish in time")
        .expect("registry dropped")
}

#[tokio::test]
async fn test_diamond_runs_to_success() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;
    assert!(runtime.is_running());

    let (graph_id, completion) = run_graph(&runtime, "Graph.Diamond", json!({})).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Succeeded);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.status, GraphStatus::Succeeded);
    assert!(graph.completed_at.is_some());
    for task in graph.tasks.values() {
        assert_eq!(task.state, TaskState::Succeeded, "{}", task.label);
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }
    assert_eq!(
        graph.tasks["D"].detail,
        Some(json!({ "label": "D", "attempt": 0 }))
    );
    assert!(runtime.registry().fetch_active_graphs_sync().is_empty());
    assert_eq!(runtime.scheduler_stats().tasks_succeeded, 4);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_diamond_failure_skips_join() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;

    let (graph_id, completion) =
        run_graph(&runtime, "Graph.Diamond", json!({ "B": { "fail": true } })).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Failed);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.tasks["A"].state, TaskState::Succeeded);
    assert_eq!(graph.tasks["B"].state, TaskState::Failed);
    assert_eq!(graph.tasks["C"].state, TaskState::Succeeded);
    assert_eq!(graph.tasks["D"].state, TaskState::Pending);
    assert_eq!(
        graph.tasks["B"].detail,
        Some(json!({ "error": "Task failed: B told to fail" }))
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_handler_branch_runs() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;
    runtime
        .registry()
        .register_graph(
            GraphDefinition::new("Graph.Cleanup")
                .task(GraphTaskNode::new("work", "Task.Script"))
                .task(
                    GraphTaskNode::new("cleanup", "Task.Script")
                        .wait_on("work", WaitPredicate::Failed),
                )
                .task(
                    GraphTaskNode::new("report", "Task.Script")
                        .wait_on("work", WaitPredicate::Succeeded),
                ),
        )
        .await
        .unwrap();

    let (graph_id, completion) =
        run_graph(&runtime, "Graph.Cleanup", json!({ "work": { "fail": true } })).await;
    // the failure is handled by the cleanup branch
    assert_eq!(await_completion(completion).await, GraphStatus::Succeeded);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.tasks["cleanup"].state, TaskState::Succeeded);
    assert_eq!(graph.tasks["report"].state, TaskState::Pending);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retries_until_success() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;
    runtime
        .registry()
        .register_graph(GraphDefinition::new("Graph.Flaky").task(
            common::with_scheduler_overrides(
                GraphTaskNode::new("flaky", "Task.Script"),
                json!({ "retries": 2 }),
            ),
        ))
        .await
        .unwrap();

    let (graph_id, completion) =
        run_graph(&runtime, "Graph.Flaky", json!({ "flaky": { "failAttempts": 2 } })).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Succeeded);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    let task = &graph.tasks["flaky"];
    assert_eq!(task.attempt, 2);
    assert_eq!(task.retries_attempted, 2);
    assert_eq!(runtime.scheduler_stats().tasks_retried, 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_fails_graph() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;

    let options = json!({ "A": { "sleepMs": 10_000, "_taskTimeout": 100 } });
    let (graph_id, completion) = run_graph(&runtime, "Graph.Diamond", options).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Failed);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.tasks["A"].state, TaskState::Timeout);
    assert_eq!(runtime.scheduler_stats().tasks_timed_out, 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_with_storage_messenger() {
    let store = common::sqlite_store().await;
    let messenger = common::storage_messenger(store.clone());
    let runtime = start_runtime(store.clone(), messenger).await;

    let (graph_id, completion) = run_graph(&runtime, "Graph.Diamond", json!({})).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Succeeded);

    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.status, GraphStatus::Succeeded);

    // rows are deleted once the pass that finalized the graph ends
    let drained = common::wait_until(Duration::from_secs(1), || {
        let store = store.clone();
        async move {
            store
                .find_completed_tasks("default", 100)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    assert!(drained);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_noop_graph_with_builtin_kinds() {
    let store = common::memory_store();
    let runtime = start_runtime(store.clone(), common::broker()).await;

    let (_graph_id, completion) = run_graph(&runtime, "Graph.Noop", json!({})).await;
    assert_eq!(await_completion(completion).await, GraphStatus::Succeeded);

    runtime.shutdown().await.unwrap();
}
