// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messenger backed by the store's `taskevents` log.
//!
//! Publishing appends a record; each subscription tails the log by polling
//! from the newest sequence id seen at subscribe time. Works across processes
//! that share one database without any broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    CancelGraphEvent, CancelTaskEvent, GraphFinishedEvent, Messenger, RunTaskEvent,
    SUBSCRIPTION_BUFFER, Subscription, TaskFinishedEvent,
};
use crate::error::Result;
use crate::store::{Store, TaskEventAction};

const POLL_BATCH: usize = 100;

/// Storage-polling messenger.
pub struct StorageMessenger {
    store: Arc<dyn Store>,
    poll_interval: Duration,
}

impl StorageMessenger {
    /// Messenger tailing `store` every `poll_interval`.
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    async fn subscribe<E>(
        &self,
        action: TaskEventAction,
        routing_key: Option<String>,
    ) -> Result<Subscription<E>>
    where
        E: DeserializeOwned + Send + 'static,
    {
        let mut cursor = self.store.latest_task_event_id().await?;
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let records = match store
                    .find_task_events(action, routing_key.as_deref(), cursor, POLL_BATCH)
                    .await
                {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(action = %action, error = %e, "Failed to poll task events");
                        continue;
                    }
                };

                for record in records {
                    cursor = record.id;
                    match serde_json::from_value::<E>(record.payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(action = %action, id = record.id, error = %e, "Dropping undecodable event")
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx, forwarder))
    }

    async fn publish<E: Serialize>(
        &self,
        action: TaskEventAction,
        routing_key: &str,
        event: &E,
    ) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        self.store
            .append_task_event(action, routing_key, &payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Messenger for StorageMessenger {
    fn backend(&self) -> &'static str {
        "storage-poll"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe_run_task(&self, domain: &str) -> Result<Subscription<RunTaskEvent>> {
        self.subscribe(TaskEventAction::Run, Some(domain.to_string()))
            .await
    }

    async fn publish_run_task(&self, event: &RunTaskEvent) -> Result<()> {
        self.publish(TaskEventAction::Run, &event.domain, event).await
    }

    async fn subscribe_cancel_task(&self, task_id: &str) -> Result<Subscription<CancelTaskEvent>> {
        self.subscribe(TaskEventAction::Cancel, Some(task_id.to_string()))
            .await
    }

    async fn publish_cancel_task(&self, event: &CancelTaskEvent) -> Result<()> {
        self.publish(TaskEventAction::Cancel, &event.task_id, event)
            .await
    }

    async fn subscribe_task_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<TaskFinishedEvent>> {
        self.subscribe(TaskEventAction::Finished, Some(domain.to_string()))
            .await
    }

    async fn publish_task_finished(&self, event: &TaskFinishedEvent) -> Result<()> {
        self.publish(TaskEventAction::Finished, &event.domain, event)
            .await
    }

    async fn subscribe_cancel_graph(&self) -> Result<Subscription<CancelGraphEvent>> {
        self.subscribe(TaskEventAction::CancelGraph, None).await
    }

    async fn publish_cancel_graph(&self, event: &CancelGraphEvent) -> Result<()> {
        self.publish(TaskEventAction::CancelGraph, "", event).await
    }

    async fn subscribe_graph_finished(&self) -> Result<Subscription<GraphFinishedEvent>> {
        self.subscribe(TaskEventAction::GraphFinished, None).await
    }

    async fn publish_graph_finished(&self, event: &GraphFinishedEvent) -> Result<()> {
        self.publish(TaskEventAction::GraphFinished, "", event)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskState;
    use crate::messenger::TaskStats;
    use crate::store::MemoryStore;

    fn messenger() -> (Arc<dyn Store>, StorageMessenger) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let messenger = StorageMessenger::new(store.clone(), Duration::from_millis(10));
        (store, messenger)
    }

    fn finished(domain: &str, task_id: &str) -> TaskFinishedEvent {
        TaskFinishedEvent {
            domain: domain.to_string(),
            task_id: task_id.to_string(),
            graph_id: "g1".to_string(),
            state: TaskState::Succeeded,
            detail: None,
            stats: TaskStats::default(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_newer_records() {
        let (_store, messenger) = messenger();
        messenger
            .publish_task_finished(&finished("lab", "before"))
            .await
            .unwrap();

        let mut sub = messenger.subscribe_task_finished("lab").await.unwrap();
        messenger
            .publish_task_finished(&finished("lab", "after"))
            .await
            .unwrap();
        messenger
            .publish_task_finished(&finished("other", "elsewhere"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task_id, "after");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cancel_graph_uses_log() {
        let (store, messenger) = messenger();
        let mut sub = messenger.subscribe_cancel_graph().await.unwrap();
        messenger
            .publish_cancel_graph(&CancelGraphEvent {
                graph_id: Some("g9".to_string()),
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.graph_id.as_deref(), Some("g9"));
        assert_eq!(store.latest_task_event_id().await.unwrap(), 1);
    }
}
