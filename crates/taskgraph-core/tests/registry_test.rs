// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target exclusivity across registries sharing one store.

mod common;

use std::sync::Arc;

use taskgraph_core::Error;
use taskgraph_core::graph::{BuildOptions, GraphStatus};
use taskgraph_core::registry::ActiveGraphFilter;
use taskgraph_core::store::Store;

async fn stores() -> Vec<Arc<dyn Store>> {
    vec![common::memory_store(), common::sqlite_store().await]
}

fn targeted(target: &str) -> BuildOptions {
    BuildOptions {
        target: Some(target.to_string()),
        ..BuildOptions::default()
    }
}

#[tokio::test]
async fn test_second_registry_cannot_take_live_target() {
    for store in stores().await {
        let backend = store.backend();
        let first = common::registry(store.clone()).await;
        let second = common::registry(store.clone()).await;

        let (graph, _completion) = first
            .create_graph("Graph.Noop", targeted("node-1"))
            .await
            .unwrap();

        match second.create_graph("Graph.Noop", targeted("node-1")).await {
            Err(Error::DuplicateActiveGraph {
                target,
                instance_id,
            }) => {
                assert_eq!(target, "node-1");
                assert_eq!(instance_id, graph.instance_id, "{}", backend);
            }
            other => panic!("{}: expected duplicate, got {:?}", backend, other.map(|(g, _)| g)),
        }

        let bound: Vec<_> = store
            .find_running_graphs("default")
            .await
            .unwrap()
            .into_iter()
            .filter(|running| running.target.as_deref() == Some("node-1"))
            .collect();
        assert_eq!(bound.len(), 1, "{}", backend);
        assert_eq!(bound[0].status, GraphStatus::Running);

        // the refused create leaves nothing indexed
        assert!(
            second
                .fetch_active_graph_sync(&ActiveGraphFilter::target("node-1"))
                .is_none()
        );
        let seen = second.find_active_graph("node-1").await.unwrap().unwrap();
        assert_eq!(seen.instance_id, graph.instance_id);
        assert!(
            second
                .fetch_active_graph_sync(&ActiveGraphFilter::target("node-1"))
                .is_some()
        );

        // other targets are unaffected
        second
            .create_graph("Graph.Noop", targeted("node-2"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_creates_bind_target_once() {
    for store in stores().await {
        let first = common::registry(store.clone()).await;
        let second = common::registry(store.clone()).await;

        let (a, b) = tokio::join!(
            first.create_graph("Graph.Noop", targeted("node-9")),
            second.create_graph("Graph.Noop", targeted("node-9")),
        );
        let created = [a.is_ok(), b.is_ok()].into_iter().filter(|ok| *ok).count();
        assert_eq!(created, 1, "{}", store.backend());
        assert!(store.find_active_graph_for_target("node-9").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_load_indexes_live_graphs() {
    for store in stores().await {
        let creator = common::registry(store.clone()).await;
        let (graph, _completion) = creator
            .create_graph("Graph.Noop", targeted("node-3"))
            .await
            .unwrap();

        let restarted = common::registry(store.clone()).await;
        let active = restarted
            .fetch_active_graph_sync(&ActiveGraphFilter::target("node-3"))
            .expect("live graph not indexed on load");
        assert_eq!(active.instance_id, graph.instance_id);
        assert_eq!(active.target.as_deref(), Some("node-3"));

        assert!(matches!(
            restarted.create_graph("Graph.Noop", targeted("node-3")).await,
            Err(Error::DuplicateActiveGraph { .. })
        ));
    }
}
