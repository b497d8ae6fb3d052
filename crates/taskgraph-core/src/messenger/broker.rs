// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process topic broker.
//!
//! Each topic key (`run.<domain>`, `cancel.<taskId>`, `finished.<domain>`,
//! `graph.cancel`, `graph.finished`) owns a tokio broadcast channel carrying JSON bodies, so
//! events cross the boundary in their wire form exactly as they would through
//! an external broker. A topic is removed once its last subscription is
//! dropped.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{
    CancelGraphEvent, CancelTaskEvent, GraphFinishedEvent, Messenger, RunTaskEvent,
    SUBSCRIPTION_BUFFER, Subscription, TaskFinishedEvent,
};
use crate::error::Result;

const CANCEL_GRAPH_TOPIC: &str = "graph.cancel";
const GRAPH_FINISHED_TOPIC: &str = "graph.finished";

fn run_topic(domain: &str) -> String {
    format!("run.{}", domain)
}

fn cancel_topic(task_id: &str) -> String {
    format!("cancel.{}", task_id)
}

fn finished_topic(domain: &str) -> String {
    format!("finished.{}", domain)
}

type Topics = DashMap<String, broadcast::Sender<String>>;

/// Receiving end of one subscription. Dropping it releases the topic when no
/// other subscriber is left.
struct TopicReceiver {
    rx: Option<broadcast::Receiver<String>>,
    topics: Weak<Topics>,
    topic: String,
}

impl TopicReceiver {
    async fn recv(&mut self) -> std::result::Result<String, broadcast::error::RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }
}

impl Drop for TopicReceiver {
    fn drop(&mut self) {
        drop(self.rx.take());
        if let Some(topics) = self.topics.upgrade() {
            topics.remove_if(&self.topic, |_, sender| sender.receiver_count() == 0);
        }
    }
}

/// Topic broker living in the current process.
pub struct BrokerMessenger {
    topics: Arc<Topics>,
    capacity: usize,
}

impl BrokerMessenger {
    /// Broker whose topics buffer up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics with a live channel.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn subscribe<E>(&self, topic: String) -> Subscription<E>
    where
        E: DeserializeOwned + Send + 'static,
    {
        let rx = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        let mut receiver = TopicReceiver {
            rx: Some(rx),
            topics: Arc::downgrade(&self.topics),
            topic,
        };
        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let forwarder = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(body) => match serde_json::from_str::<E>(&body) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %receiver.topic, error = %e, "Dropping undecodable event")
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %receiver.topic, skipped = skipped, "Subscriber lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(out, forwarder)
    }

    fn publish<E: Serialize>(&self, topic: &str, event: &E) -> Result<()> {
        let body = serde_json::to_string(event)?;
        let delivered = match self.topics.get(topic) {
            Some(sender) => sender.send(body).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            debug!(topic = %topic, "Published event had no subscribers");
            self.topics
                .remove_if(topic, |_, sender| sender.receiver_count() == 0);
        }
        Ok(())
    }
}

impl Default for BrokerMessenger {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Messenger for BrokerMessenger {
    fn backend(&self) -> &'static str {
        "broker"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe_run_task(&self, domain: &str) -> Result<Subscription<RunTaskEvent>> {
        Ok(self.subscribe(run_topic(domain)))
    }

    async fn publish_run_task(&self, event: &RunTaskEvent) -> Result<()> {
        self.publish(&run_topic(&event.domain), event)
    }

    async fn subscribe_cancel_task(&self, task_id: &str) -> Result<Subscription<CancelTaskEvent>> {
        Ok(self.subscribe(cancel_topic(task_id)))
    }

    async fn publish_cancel_task(&self, event: &CancelTaskEvent) -> Result<()> {
        self.publish(&cancel_topic(&event.task_id), event)
    }

    async fn subscribe_task_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<TaskFinishedEvent>> {
        Ok(self.subscribe(finished_topic(domain)))
    }

    async fn publish_task_finished(&self, event: &TaskFinishedEvent) -> Result<()> {
        self.publish(&finished_topic(&event.domain), event)
    }

    async fn subscribe_cancel_graph(&self) -> Result<Subscription<CancelGraphEvent>> {
        Ok(self.subscribe(CANCEL_GRAPH_TOPIC.to_string()))
    }

    async fn publish_cancel_graph(&self, event: &CancelGraphEvent) -> Result<()> {
        self.publish(CANCEL_GRAPH_TOPIC, event)
    }

    async fn subscribe_graph_finished(&self) -> Result<Subscription<GraphFinishedEvent>> {
        Ok(self.subscribe(GRAPH_FINISHED_TOPIC.to_string()))
    }

    async fn publish_graph_finished(&self, event: &GraphFinishedEvent) -> Result<()> {
        self.publish(GRAPH_FINISHED_TOPIC, event)
    }
}
