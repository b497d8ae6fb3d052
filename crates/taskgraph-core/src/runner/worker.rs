// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that executes dispatched tasks.
//!
//! The runner subscribes to run-task for its domain. Each event is handled on
//! its own tokio task:
//!
//! 1. duplicates for a task already running here are dropped, otherwise the
//!    runner subscribes to cancel-task for it;
//! 2. the task is loaded and stale attempts are discarded;
//! 3. `runJob` is resolved in the [`TaskKindCatalog`];
//! 4. the kind executes until it returns or a cancel-task arrives;
//! 5. task-finished is published with the outcome and timing stats.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{TaskContext, TaskKindCatalog};
use crate::error::Result;
use crate::graph::{TaskInstance, TaskState};
use crate::messenger::{
    CancelTaskEvent, Messenger, RunTaskEvent, Subscription, TaskFinishedEvent, TaskStats,
};
use crate::store::Store;

/// Configuration for the task runner.
#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// Domain whose run-task events this runner consumes.
    pub domain: String,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
        }
    }
}

struct Execution {
    attempt: u32,
    token: CancellationToken,
}

#[derive(Clone)]
struct Shared {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    kinds: Arc<TaskKindCatalog>,
    active: Arc<DashMap<String, Execution>>,
    stopping: CancellationToken,
}

/// Executes run-task events for one domain.
pub struct TaskRunner {
    shared: Shared,
    config: TaskRunnerConfig,
    shutdown: Arc<Notify>,
}

impl TaskRunner {
    /// Create a new task runner.
    pub fn new(
        store: Arc<dyn Store>,
        messenger: Arc<dyn Messenger>,
        kinds: Arc<TaskKindCatalog>,
        config: TaskRunnerConfig,
    ) -> Self {
        Self {
            shared: Shared {
                store,
                messenger,
                kinds,
                active: Arc::new(DashMap::new()),
                stopping: CancellationToken::new(),
            },
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Number of executions currently in progress.
    pub fn active_count(&self) -> usize {
        self.shared.active.len()
    }

    /// Subscribe to run-task for the configured domain.
    ///
    /// Split from [`run_with`](Self::run_with) so callers can be sure the
    /// subscription exists before anything is dispatched.
    pub async fn subscribe(&self) -> Result<Subscription<RunTaskEvent>> {
        self.shared
            .messenger
            .subscribe_run_task(&self.config.domain)
            .await
    }

    /// Subscribe and serve until shutdown.
    pub async fn run(&self) {
        match self.subscribe().await {
            Ok(subscription) => self.run_with(subscription).await,
            Err(e) => {
                error!(domain = %self.config.domain, error = %e, "Task runner failed to subscribe");
            }
        }
    }

    /// Serve an existing subscription until shutdown.
    ///
    /// Executions still in progress when the loop exits are cancelled and
    /// report nothing; their leases lapse and the tasks are re-offered.
    pub async fn run_with(&self, mut subscription: Subscription<RunTaskEvent>) {
        info!(
            domain = %self.config.domain,
            kinds = ?self.shared.kinds.names(),
            "Task runner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task runner received shutdown signal");
                    break;
                }

                event = subscription.recv() => {
                    match event {
                        Some(event) => self.spawn_execution(event).await,
                        None => {
                            warn!(domain = %self.config.domain, "run-task subscription closed");
                            break;
                        }
                    }
                }
            }
        }

        self.shared.stopping.cancel();
        info!(
            abandoned = self.shared.active.len(),
            "Task runner stopped"
        );
    }

    async fn spawn_execution(&self, event: RunTaskEvent) {
        let token = self.shared.stopping.child_token();
        match self.shared.active.entry(event.task_id.clone()) {
            Entry::Occupied(mut running) => {
                if event.attempt <= running.get().attempt {
                    debug!(
                        task_id = %event.task_id,
                        attempt = event.attempt,
                        "Ignoring duplicate run-task"
                    );
                    return;
                }
                // a newer attempt supersedes the local one
                running.get().token.cancel();
                running.insert(Execution {
                    attempt: event.attempt,
                    token: token.clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Execution {
                    attempt: event.attempt,
                    token: token.clone(),
                });
            }
        }

        // subscribed before the execution starts so an early cancel-task is buffered
        let cancel_subscription = match self
            .shared
            .messenger
            .subscribe_cancel_task(&event.task_id)
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(task_id = %event.task_id, error = %e, "Running without cancel-task subscription");
                None
            }
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let task_id = event.task_id.clone();
            let attempt = event.attempt;
            if let Err(e) = execute_event(&shared, event, token, cancel_subscription).await {
                error!(task_id = %task_id, attempt, error = %e, "Task execution failed");
            }
            shared
                .active
                .remove_if(&task_id, |_, execution| execution.attempt == attempt);
        });
    }
}

async fn next_cancel(
    subscription: &mut Option<Subscription<CancelTaskEvent>>,
) -> Option<CancelTaskEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn execute_event(
    shared: &Shared,
    event: RunTaskEvent,
    token: CancellationToken,
    cancel_subscription: Option<Subscription<CancelTaskEvent>>,
) -> Result<()> {
    let Some(task) = shared.store.get_task(&event.task_id).await? else {
        warn!(task_id = %event.task_id, "run-task for unknown task");
        return Ok(());
    };
    if task.attempt != event.attempt || task.state.is_terminal() {
        debug!(
            task_id = %task.task_id,
            stored_attempt = task.attempt,
            event_attempt = event.attempt,
            state = %task.state,
            "Discarding stale run-task"
        );
        return Ok(());
    }

    let started = Utc::now();
    let (state, detail) = run_kind(shared, &task, token, cancel_subscription).await?;
    if shared.stopping.is_cancelled() && state == TaskState::Cancelled {
        debug!(task_id = %task.task_id, "Execution abandoned on shutdown");
        return Ok(());
    }

    let finished = TaskFinishedEvent {
        domain: task.domain.clone(),
        task_id: task.task_id.clone(),
        graph_id: task.graph_id.clone(),
        state,
        detail,
        stats: TaskStats {
            started: Some(started),
            completed: Some(Utc::now()),
        },
        attempt: task.attempt,
    };
    shared.messenger.publish_task_finished(&finished).await?;

    info!(
        task_id = %task.task_id,
        graph_id = %task.graph_id,
        label = %task.label,
        attempt = task.attempt,
        state = %state,
        "Task finished"
    );
    Ok(())
}

async fn run_kind(
    shared: &Shared,
    task: &TaskInstance,
    token: CancellationToken,
    mut cancel_subscription: Option<Subscription<CancelTaskEvent>>,
) -> Result<(TaskState, Option<Value>)> {
    let Some(kind) = shared.kinds.get(&task.run_job) else {
        warn!(task_id = %task.task_id, run_job = %task.run_job, "Unknown task kind");
        return Ok((
            TaskState::Failed,
            Some(json!({ "error": format!("Unknown task kind '{}'", task.run_job) })),
        ));
    };

    let graph_context = shared
        .store
        .get_graph(&task.graph_id)
        .await?
        .map(|graph| graph.context)
        .unwrap_or(Value::Null);

    let context = TaskContext {
        task_id: task.task_id.clone(),
        graph_id: task.graph_id.clone(),
        label: task.label.clone(),
        domain: task.domain.clone(),
        attempt: task.attempt,
        graph_context,
        cancellation: token.clone(),
    };

    debug!(task_id = %task.task_id, run_job = %task.run_job, attempt = task.attempt, "Executing task");

    let outcome = tokio::select! {
        result = kind.execute(&task.options, &context) => Some(result),
        _ = token.cancelled() => None,
        Some(_) = next_cancel(&mut cancel_subscription) => {
            token.cancel();
            None
        }
    };

    Ok(match outcome {
        Some(Ok(detail)) => (TaskState::Succeeded, detail),
        Some(Err(e)) => (TaskState::Failed, Some(e.detail())),
        None => (TaskState::Cancelled, None),
    })
}
