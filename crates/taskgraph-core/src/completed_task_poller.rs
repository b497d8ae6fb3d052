// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that finalizes graphs.
//!
//! Every terminal task leaves a bookkeeping row in the store. The poller reads
//! a batch of rows for its domain, keeps only the newest row per graph, checks
//! each of those graphs once and deletes the whole batch. A graph whose
//! completion status is terminal is finalized with a conditional update, so
//! when several pollers race only the first one fires the registry completion.
//!
//! A finalized graph is announced with a graph-finished event. Pollers holding
//! another registry apply those events to their own active-graph index, so a
//! completion awaited in one process resolves even when a poller in another
//! process finalized the graph.
//!
//! The poller wakes on task-finished events and on its own interval; the
//! interval also covers events lost by the transport by checking every
//! indexed graph against the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::graph::{GraphStatus, TaskState};
use crate::messenger::{GraphFinishedEvent, Messenger, Subscription, TaskFinishedEvent};
use crate::registry::Registry;
use crate::store::{CompletedTaskRecord, Store};

/// Configuration for the completed task poller.
#[derive(Debug, Clone)]
pub struct CompletedTaskPollerConfig {
    /// Domain whose rows are processed.
    pub domain: String,
    /// Fallback interval between passes.
    pub poll_interval: Duration,
    /// Maximum rows read per pass.
    pub batch_size: usize,
}

impl Default for CompletedTaskPollerConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// What one [`CompletedTaskPoller::poll_once`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Rows read.
    pub records: usize,
    /// Graphs evaluated (one per distinct graph id).
    pub graphs_checked: usize,
    /// Graphs that reached a terminal status in this pass.
    pub graphs_finalized: usize,
}

/// Subscriptions feeding a running poller.
pub struct PollerSubscriptions {
    /// Wakes the poller when tasks of its domain finish.
    pub task_finished: Subscription<TaskFinishedEvent>,
    /// Graphs finalized by any poller.
    pub graph_finished: Subscription<GraphFinishedEvent>,
}

/// Keep the newest row of every graph, in row order.
pub fn retain_last_per_graph(records: &[CompletedTaskRecord]) -> Vec<&CompletedTaskRecord> {
    let mut last: HashMap<&str, &CompletedTaskRecord> = HashMap::new();
    for record in records {
        last.entry(record.graph_id.as_str())
            .and_modify(|kept| {
                if record.id > kept.id {
                    *kept = record;
                }
            })
            .or_insert(record);
    }
    let mut retained: Vec<&CompletedTaskRecord> = last.into_values().collect();
    retained.sort_by_key(|record| record.id);
    retained
}

/// Background worker that turns completed-task rows into graph completions.
pub struct CompletedTaskPoller {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<Registry>,
    config: CompletedTaskPollerConfig,
    shutdown: Arc<Notify>,
}

impl CompletedTaskPoller {
    /// Create a new completed task poller.
    pub fn new(
        store: Arc<dyn Store>,
        messenger: Arc<dyn Messenger>,
        registry: Arc<Registry>,
        config: CompletedTaskPollerConfig,
    ) -> Self {
        Self {
            store,
            messenger,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Subscribe to the task-finished and graph-finished events.
    pub async fn subscribe(&self) -> Result<PollerSubscriptions> {
        Ok(PollerSubscriptions {
            task_finished: self
                .messenger
                .subscribe_task_finished(&self.config.domain)
                .await?,
            graph_finished: self.messenger.subscribe_graph_finished().await?,
        })
    }

    /// Run without event wake-ups if the subscriptions cannot be created.
    pub async fn run(&self) {
        let subscriptions = match self.subscribe().await {
            Ok(subscriptions) => Some(subscriptions),
            Err(e) => {
                warn!(error = %e, "Completed task poller running on its interval only");
                None
            }
        };
        self.run_with(subscriptions).await;
    }

    /// Run the poller loop until shutdown.
    pub async fn run_with(&self, subscriptions: Option<PollerSubscriptions>) {
        let (mut task_finished, mut graph_finished) = match subscriptions {
            Some(subscriptions) => (
                Some(subscriptions.task_finished),
                Some(subscriptions.graph_finished),
            ),
            None => (None, None),
        };
        info!(
            domain = %self.config.domain,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Completed task poller started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Completed task poller received shutdown signal");
                    break;
                }

                Some(_) = next_finished(&mut task_finished) => {
                    self.run_pass().await;
                }

                Some(event) = next_event(&mut graph_finished) => {
                    if self.registry.complete_active_graph(&event.graph_id, event.status) {
                        debug!(graph_id = %event.graph_id, status = %event.status, "Graph finished elsewhere");
                    }
                }

                _ = interval.tick() => {
                    self.run_pass().await;
                    if let Err(e) = self.registry.sync_active_graphs().await {
                        error!(error = %e, "Failed to sync active graphs");
                    }
                }
            }
        }

        info!("Completed task poller stopped");
    }

    async fn run_pass(&self) {
        match self.poll_once().await {
            Ok(summary) if summary.records > 0 => debug!(?summary, "Completed task pass"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to process completed tasks"),
        }
    }

    /// Process one batch of completed-task rows.
    ///
    /// Rows of a graph whose evaluation failed are kept for the next pass.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let records = self
            .store
            .find_completed_tasks(&self.config.domain, self.config.batch_size)
            .await?;
        let mut summary = PollSummary {
            records: records.len(),
            ..PollSummary::default()
        };
        if records.is_empty() {
            return Ok(summary);
        }

        let mut failed: HashSet<&str> = HashSet::new();
        for record in retain_last_per_graph(&records) {
            summary.graphs_checked += 1;
            match self.handle_potential_finished_graph(&record.graph_id).await {
                Ok(Some(_)) => summary.graphs_finalized += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(graph_id = %record.graph_id, error = %e, "Failed to evaluate graph");
                    failed.insert(record.graph_id.as_str());
                }
            }
        }

        let processed: Vec<i64> = records
            .iter()
            .filter(|record| !failed.contains(record.graph_id.as_str()))
            .map(|record| record.id)
            .collect();
        self.store.delete_completed_tasks(&processed).await?;
        Ok(summary)
    }

    /// Finalize a graph if no reachable node is left to run.
    ///
    /// Returns the status written, or `None` when the graph is missing,
    /// already finalized, still open, or another writer got there first.
    pub async fn handle_potential_finished_graph(
        &self,
        graph_id: &str,
    ) -> Result<Option<GraphStatus>> {
        let Some(graph) = self.store.get_graph(graph_id).await? else {
            debug!(graph_id = %graph_id, "Completed task for unknown graph");
            return Ok(None);
        };
        if graph.status != GraphStatus::Running {
            return Ok(None);
        }
        let Some(status) = graph.completion_status() else {
            return Ok(None);
        };

        if !self
            .store
            .set_graph_done(graph_id, status, Utc::now())
            .await?
        {
            debug!(graph_id = %graph_id, "Graph already finalized");
            return Ok(None);
        }
        self.registry.complete_active_graph(graph_id, status);

        let event = GraphFinishedEvent {
            graph_id: graph_id.to_string(),
            status,
            domain: graph.domain.clone(),
            target: graph.target.clone(),
        };
        if let Err(e) = self.messenger.publish_graph_finished(&event).await {
            error!(graph_id = %graph_id, status = %status, error = %e, "Failed to publish graph finished");
        }

        let failed_tasks: Vec<&str> = graph
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Failed || task.state == TaskState::Timeout)
            .map(|task| task.label.as_str())
            .collect();
        info!(
            graph_id = %graph_id,
            graph = %graph.injectable_name,
            target = ?graph.target,
            status = %status,
            failed_tasks = ?failed_tasks,
            "Graph finished"
        );
        Ok(Some(status))
    }
}

async fn next_finished(
    subscription: &mut Option<Subscription<TaskFinishedEvent>>,
) -> Option<TaskFinishedEvent> {
    match subscription {
        Some(subscription) => {
            let event = subscription.recv().await?;
            // one pass covers every event already buffered
            while subscription.try_recv().is_some() {}
            Some(event)
        }
        None => std::future::pending().await,
    }
}

async fn next_event<E>(subscription: &mut Option<Subscription<E>>) -> Option<E> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
