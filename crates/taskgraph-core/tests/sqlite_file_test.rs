// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-backed SQLite state surviving a process restart.

mod common;

use std::sync::Arc;

use taskgraph_core::graph::{BuildOptions, GraphDefinition, GraphStatus, GraphTaskNode, TaskState};
use taskgraph_core::registry::Registry;
use taskgraph_core::store::{SqliteStore, Store};

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("taskgraph.db");

    let graph_id = {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
        let registry = common::registry(store.clone()).await;
        registry
            .register_graph(
                GraphDefinition::new("Graph.Custom").task(GraphTaskNode::new("only", "Task.Noop")),
            )
            .await
            .unwrap();
        let (graph, _completion) = registry
            .create_graph("Graph.Custom", BuildOptions::default())
            .await
            .unwrap();
        assert!(
            store
                .transition_task(
                    &graph.tasks["only"].task_id,
                    0,
                    &[TaskState::Pending],
                    TaskState::Ready,
                )
                .await
                .unwrap()
        );
        graph.instance_id
    };

    // a fresh process with only the built-in manifest
    let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let registry = Registry::new(store.clone());
    registry
        .load(&taskgraph_core::manifest::DefinitionManifest::builtin())
        .await
        .unwrap();

    assert!(registry.fetch_graph_definition("Graph.Custom").is_some());
    let graph = store.get_graph(&graph_id).await.unwrap().unwrap();
    assert_eq!(graph.status, GraphStatus::Running);
    assert_eq!(graph.tasks["only"].state, TaskState::Ready);
    assert_eq!(store.find_running_graphs("default").await.unwrap().len(), 1);
}
