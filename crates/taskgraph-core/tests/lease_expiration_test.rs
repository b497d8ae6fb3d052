// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease acquisition and expiry against both store backends.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use taskgraph_core::lease_expiration_poller::{
    LeaseExpirationPoller, LeaseExpirationPollerConfig,
};
use taskgraph_core::messenger::{CancelGraphEvent, Subscription};
use taskgraph_core::store::{Lease, Store, TaskEventAction};

async fn stores() -> Vec<Arc<dyn Store>> {
    vec![common::memory_store(), common::sqlite_store().await]
}

fn lease(task_id: &str, scheduler_id: &str, ttl: Duration) -> Lease {
    let now = Utc::now();
    Lease {
        task_id: task_id.to_string(),
        scheduler_id: scheduler_id.to_string(),
        acquired_at: now,
        expires_at: now + ttl,
    }
}

#[tokio::test]
async fn test_expired_leases_are_reclaimed() {
    for store in stores().await {
        let backend = store.backend();
        assert!(
            store
                .acquire_lease(&lease("stale-1", "s1", Duration::milliseconds(-10)))
                .await
                .unwrap()
        );
        assert!(
            store
                .acquire_lease(&lease("stale-2", "s1", Duration::milliseconds(-10)))
                .await
                .unwrap()
        );
        assert!(
            store
                .acquire_lease(&lease("live", "s2", Duration::seconds(60)))
                .await
                .unwrap()
        );

        let poller = LeaseExpirationPoller::new(store.clone(), LeaseExpirationPollerConfig::default());
        assert_eq!(poller.expire_leases().await.unwrap(), 2, "{}", backend);
        assert_eq!(poller.expire_leases().await.unwrap(), 0, "{}", backend);

        assert!(store.get_lease("stale-1").await.unwrap().is_none(), "{}", backend);
        assert!(store.get_lease("stale-2").await.unwrap().is_none(), "{}", backend);
        let live = store.get_lease("live").await.unwrap().unwrap();
        assert_eq!(live.scheduler_id, "s2");
    }
}

#[tokio::test]
async fn test_batch_size_bounds_one_pass() {
    for store in stores().await {
        for i in 0..5 {
            store
                .acquire_lease(&lease(&format!("t{}", i), "s1", Duration::milliseconds(-10)))
                .await
                .unwrap();
        }
        let poller = LeaseExpirationPoller::new(
            store.clone(),
            LeaseExpirationPollerConfig {
                batch_size: 2,
                ..LeaseExpirationPollerConfig::default()
            },
        );
        assert_eq!(poller.expire_leases().await.unwrap(), 2);
        assert_eq!(poller.expire_leases().await.unwrap(), 2);
        assert_eq!(poller.expire_leases().await.unwrap(), 1);
        assert_eq!(poller.expire_leases().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_renewed_lease_survives_expiry_pass() {
    for store in stores().await {
        store
            .acquire_lease(&lease("t", "s1", Duration::milliseconds(-10)))
            .await
            .unwrap();
        assert!(
            store
                .renew_lease("t", "s1", Utc::now() + Duration::seconds(60))
                .await
                .unwrap()
        );
        // a foreign scheduler cannot renew
        assert!(
            !store
                .renew_lease("t", "s2", Utc::now() + Duration::seconds(60))
                .await
                .unwrap()
        );

        let poller = LeaseExpirationPoller::new(store.clone(), LeaseExpirationPollerConfig::default());
        assert_eq!(poller.expire_leases().await.unwrap(), 0);
        assert_eq!(store.get_lease("t").await.unwrap().unwrap().scheduler_id, "s1");
    }
}

#[tokio::test]
async fn test_concurrent_acquisition_has_one_winner() {
    for store in stores().await {
        let attempts = (0..16).map(|i| {
            let store = store.clone();
            async move {
                store
                    .acquire_lease(&lease("contested", &format!("s{}", i), Duration::seconds(60)))
                    .await
                    .unwrap()
            }
        });
        let won = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1, "{}", store.backend());

        // an expired lease can be taken over
        store.release_lease("contested").await.unwrap();
        store
            .acquire_lease(&lease("contested", "old", Duration::milliseconds(-10)))
            .await
            .unwrap();
        assert!(
            store
                .acquire_lease(&lease("contested", "new", Duration::seconds(60)))
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_lease("contested").await.unwrap().unwrap().scheduler_id,
            "new"
        );
    }
}

#[test]
fn test_poll_interval_tracks_lease_duration() {
    let config = LeaseExpirationPollerConfig::for_lease_adjust(std::time::Duration::from_secs(30));
    assert_eq!(config.poll_interval, std::time::Duration::from_secs(60));
}

fn cancel_graph(graph_id: &str) -> CancelGraphEvent {
    CancelGraphEvent {
        graph_id: Some(graph_id.to_string()),
    }
}

async fn next_graph_id(subscription: &mut Subscription<CancelGraphEvent>) -> Option<String> {
    tokio::time::timeout(std::time::Duration::from_secs(2), subscription.recv())
        .await
        .expect("event not delivered")
        .expect("subscription closed")
        .graph_id
}

#[tokio::test]
async fn test_event_log_pruned_without_losing_subscribers() {
    for store in stores().await {
        let backend = store.backend();
        let messenger = common::storage_messenger(store.clone());
        let mut subscription = messenger.subscribe_cancel_graph().await.unwrap();

        messenger.publish_cancel_graph(&cancel_graph("g1")).await.unwrap();
        assert_eq!(next_graph_id(&mut subscription).await.as_deref(), Some("g1"));

        // fresh records survive the default retention
        let keep = LeaseExpirationPoller::new(store.clone(), LeaseExpirationPollerConfig::default());
        assert_eq!(keep.prune_task_events().await.unwrap(), 0, "{}", backend);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let prune = LeaseExpirationPoller::new(
            store.clone(),
            LeaseExpirationPollerConfig {
                event_retention: std::time::Duration::from_millis(5),
                ..LeaseExpirationPollerConfig::default()
            },
        );
        assert_eq!(prune.prune_task_events().await.unwrap(), 1, "{}", backend);
        assert!(
            store
                .find_task_events(TaskEventAction::CancelGraph, None, 0, 10)
                .await
                .unwrap()
                .is_empty()
        );

        messenger.publish_cancel_graph(&cancel_graph("g2")).await.unwrap();
        assert_eq!(next_graph_id(&mut subscription).await.as_deref(), Some("g2"));
        let replay =
            tokio::time::timeout(std::time::Duration::from_millis(100), subscription.recv()).await;
        assert!(replay.is_err(), "{}: unexpected event {:?}", backend, replay);
    }
}
