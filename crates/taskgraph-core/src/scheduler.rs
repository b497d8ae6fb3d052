// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-domain task scheduler.
//!
//! The scheduler moves tasks of running graphs through
//! `pending → ready → leased → dispatched` and records their terminal state.
//! Every tick it:
//!
//! 1. renews the leases of the tasks it has in flight (a lost lease drops the
//!    task locally),
//! 2. times out tasks that exceeded `timeoutMs`,
//! 3. collects ready tasks of running graphs plus orphaned in-flight tasks
//!    whose lease is gone (re-offered under a new attempt),
//! 4. dispatches candidates up to `concurrent_tasks`.
//!
//! Results arrive as task-finished events. A result whose attempt differs from
//! the stored attempt, or for a task that is already terminal, is discarded.
//! Multiple schedulers may serve one domain; the lease is the only point of
//! mutual exclusion between them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{TaskInstance, TaskState};
use crate::messenger::{
    CancelGraphEvent, CancelTaskEvent, Messenger, RunTaskEvent, Subscription, TaskFinishedEvent,
};
use crate::store::{FinishedTask, Lease, Store};

/// Which failure outcomes consume `retriesAllowed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry tasks that reported `failed`.
    pub retry_failed: bool,
    /// Retry tasks that hit their timeout.
    pub retry_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_failed: true,
            retry_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// Whether `task` goes back to `pending` after finishing as `outcome`.
    pub fn should_retry(&self, task: &TaskInstance, outcome: TaskState) -> bool {
        let eligible = match outcome {
            TaskState::Failed => self.retry_failed,
            TaskState::Timeout => self.retry_timeout,
            _ => false,
        };
        eligible && task.retries_attempted < task.retries_allowed
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Domain served.
    pub domain: String,
    /// Lease owner id; unique per scheduler.
    pub scheduler_id: String,
    /// Maximum tasks in flight.
    pub concurrent_tasks: usize,
    /// Lease duration; leases are renewed every tick.
    pub lease_adjust: Duration,
    /// Tick interval.
    pub poll_interval: Duration,
    /// Retry behaviour for failures and timeouts.
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            scheduler_id: Uuid::new_v4().to_string(),
            concurrent_tasks: 3,
            lease_adjust: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Monotonic counters kept by a scheduler.
#[derive(Debug, Default)]
struct SchedulerStats {
    tasks_queued: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_cancelled: AtomicU64,
    tasks_retried: AtomicU64,
    max_concurrent_exceeded: AtomicU64,
    lease_conflicts: AtomicU64,
    stale_results: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatsSnapshot {
    /// Tasks dispatched to a runner.
    pub tasks_queued: u64,
    /// Tasks recorded `succeeded`.
    pub tasks_succeeded: u64,
    /// Tasks recorded `failed`.
    pub tasks_failed: u64,
    /// Tasks recorded `timeout`.
    pub tasks_timed_out: u64,
    /// Tasks recorded `cancelled`.
    pub tasks_cancelled: u64,
    /// Failures sent back to `pending`.
    pub tasks_retried: u64,
    /// Candidates left queued because the in-flight cap was reached.
    pub max_concurrent_exceeded: u64,
    /// Lease acquisitions lost to another scheduler.
    pub lease_conflicts: u64,
    /// Results discarded as stale or duplicate.
    pub stale_results: u64,
}

/// What one [`Scheduler::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Leases extended.
    pub renewed: usize,
    /// In-flight tasks dropped because their lease was lost.
    pub lost: usize,
    /// Tasks that exceeded their timeout.
    pub timed_out: usize,
    /// Orphaned tasks returned to `ready`.
    pub reoffered: usize,
    /// Tasks dispatched.
    pub dispatched: usize,
}

/// Subscriptions the scheduler loop consumes.
pub struct SchedulerSubscriptions {
    /// task-finished for the scheduler's domain.
    pub finished: Subscription<TaskFinishedEvent>,
    /// Every cancel-graph.
    pub cancel_graph: Subscription<CancelGraphEvent>,
}

#[derive(Debug, Clone)]
struct InFlight {
    attempt: u32,
    timeout_ms: i64,
    dispatched_at: DateTime<Utc>,
}

/// Leases, dispatches and settles the tasks of one domain.
pub struct Scheduler {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    config: SchedulerConfig,
    stats: SchedulerStats,
    in_flight: DashMap<String, InFlight>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        messenger: Arc<dyn Messenger>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            messenger,
            config,
            stats: SchedulerStats::default(),
            in_flight: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SchedulerStatsSnapshot {
            tasks_queued: read(&self.stats.tasks_queued),
            tasks_succeeded: read(&self.stats.tasks_succeeded),
            tasks_failed: read(&self.stats.tasks_failed),
            tasks_timed_out: read(&self.stats.tasks_timed_out),
            tasks_cancelled: read(&self.stats.tasks_cancelled),
            tasks_retried: read(&self.stats.tasks_retried),
            max_concurrent_exceeded: read(&self.stats.max_concurrent_exceeded),
            lease_conflicts: read(&self.stats.lease_conflicts),
            stale_results: read(&self.stats.stale_results),
        }
    }

    /// Tasks this scheduler currently holds a lease for.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Subscribe to task-finished and cancel-graph.
    pub async fn subscribe(&self) -> Result<SchedulerSubscriptions> {
        Ok(SchedulerSubscriptions {
            finished: self
                .messenger
                .subscribe_task_finished(&self.config.domain)
                .await?,
            cancel_graph: self.messenger.subscribe_cancel_graph().await?,
        })
    }

    /// Subscribe and run until shutdown.
    pub async fn run(&self) {
        match self.subscribe().await {
            Ok(subscriptions) => self.run_with(subscriptions).await,
            Err(e) => {
                error!(domain = %self.config.domain, error = %e, "Scheduler failed to subscribe");
            }
        }
    }

    /// Run the scheduler loop on existing subscriptions.
    ///
    /// Leases still held when the loop exits are released so another
    /// scheduler can re-offer the tasks right away.
    pub async fn run_with(&self, mut subscriptions: SchedulerSubscriptions) {
        info!(
            domain = %self.config.domain,
            scheduler_id = %self.config.scheduler_id,
            concurrent_tasks = self.config.concurrent_tasks,
            lease_adjust_ms = self.config.lease_adjust.as_millis() as u64,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                Some(event) = subscriptions.cancel_graph.recv() => {
                    if let Err(e) = self.handle_cancel_graph(&event).await {
                        error!(graph_id = ?event.graph_id, error = %e, "Failed to cancel graph");
                    }
                }

                Some(event) = subscriptions.finished.recv() => {
                    if let Err(e) = self.handle_task_finished(&event).await {
                        error!(task_id = %event.task_id, error = %e, "Failed to handle task result");
                    }
                    // downstream nodes may have become ready
                    self.run_tick().await;
                }

                _ = interval.tick() => {
                    self.run_tick().await;
                }
            }
        }

        self.release_all().await;
        info!(stats = ?self.stats(), "Scheduler stopped");
    }

    async fn run_tick(&self) {
        match self.tick().await {
            Ok(summary) if summary != TickSummary::default() => {
                debug!(?summary, "Scheduler tick");
            }
            Ok(_) => {}
            Err(e) => error!(domain = %self.config.domain, error = %e, "Scheduler tick failed"),
        }
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        self.renew_leases(&mut summary).await?;
        self.enforce_timeouts(&mut summary).await?;
        let candidates = self.collect_candidates(&mut summary).await?;
        for task in candidates {
            if self.dispatch(&task).await? {
                summary.dispatched += 1;
            }
        }
        Ok(summary)
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(self.config.lease_adjust.as_millis() as i64)
    }

    async fn renew_leases(&self, summary: &mut TickSummary) -> Result<()> {
        let now = Utc::now();
        let expires_at = self.lease_expiry(now);
        let held: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();

        for task_id in held {
            if self
                .store
                .renew_lease(&task_id, &self.config.scheduler_id, expires_at)
                .await?
            {
                summary.renewed += 1;
            } else {
                warn!(task_id = %task_id, "Lease lost; dropping task locally");
                self.in_flight.remove(&task_id);
                summary.lost += 1;
            }
        }
        Ok(())
    }

    async fn enforce_timeouts(&self, summary: &mut TickSummary) -> Result<()> {
        let now = Utc::now();
        let expired: Vec<(String, u32)> = self
            .in_flight
            .iter()
            .filter(|entry| {
                entry.timeout_ms >= 0
                    && (now - entry.dispatched_at).num_milliseconds() >= entry.timeout_ms
            })
            .map(|entry| (entry.key().clone(), entry.attempt))
            .collect();

        for (task_id, attempt) in expired {
            self.in_flight.remove(&task_id);
            summary.timed_out += 1;

            warn!(task_id = %task_id, attempt, "Task timed out");
            if let Err(e) = self
                .messenger
                .publish_cancel_task(&CancelTaskEvent {
                    task_id: task_id.clone(),
                })
                .await
            {
                warn!(task_id = %task_id, error = %e, "Failed to publish cancel-task");
            }

            match self.store.get_task(&task_id).await? {
                Some(task) if task.attempt == attempt && !task.state.is_terminal() => {
                    let detail = serde_json::json!({
                        "error": format!("Task timed out after {}ms", task.timeout_ms)
                    });
                    self.settle(&task, TaskState::Timeout, Some(detail), task.started_at)
                        .await?;
                }
                _ => {
                    self.store.release_lease(&task_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn collect_candidates(&self, summary: &mut TickSummary) -> Result<Vec<TaskInstance>> {
        let now = Utc::now();
        let mut candidates = Vec::new();

        for graph in self.store.find_running_graphs(&self.config.domain).await? {
            candidates.extend(graph.ready_tasks().into_iter().cloned());

            for task in graph.tasks.values() {
                if !task.state.is_in_flight() || self.in_flight.contains_key(&task.task_id) {
                    continue;
                }
                let leased = self
                    .store
                    .get_lease(&task.task_id)
                    .await?
                    .is_some_and(|lease| lease.is_valid_at(now));
                if leased {
                    continue;
                }
                if self.store.reoffer_task(&task.task_id, task.attempt).await? {
                    info!(
                        task_id = %task.task_id,
                        graph_id = %task.graph_id,
                        attempt = task.attempt + 1,
                        "Re-offering orphaned task"
                    );
                    summary.reoffered += 1;
                    let mut reoffered = task.clone();
                    reoffered.state = TaskState::Ready;
                    reoffered.attempt += 1;
                    reoffered.started_at = None;
                    candidates.push(reoffered);
                }
            }
        }
        Ok(candidates)
    }

    async fn dispatch(&self, task: &TaskInstance) -> Result<bool> {
        if self.in_flight.contains_key(&task.task_id) {
            return Ok(false);
        }
        if self.in_flight.len() >= self.config.concurrent_tasks {
            bump(&self.stats.max_concurrent_exceeded);
            debug!(
                task_id = %task.task_id,
                in_flight = self.in_flight.len(),
                "Concurrency cap reached; task stays queued"
            );
            return Ok(false);
        }

        let now = Utc::now();
        let lease = Lease {
            task_id: task.task_id.clone(),
            scheduler_id: self.config.scheduler_id.clone(),
            acquired_at: now,
            expires_at: self.lease_expiry(now),
        };
        if !self.store.acquire_lease(&lease).await? {
            bump(&self.stats.lease_conflicts);
            debug!(task_id = %task.task_id, "Lease held elsewhere");
            return Ok(false);
        }

        if !self
            .store
            .transition_task(
                &task.task_id,
                task.attempt,
                &[TaskState::Pending, TaskState::Ready],
                TaskState::Leased,
            )
            .await?
        {
            debug!(task_id = %task.task_id, attempt = task.attempt, "Task moved on; releasing lease");
            self.store.release_lease(&task.task_id).await?;
            return Ok(false);
        }

        self.in_flight.insert(
            task.task_id.clone(),
            InFlight {
                attempt: task.attempt,
                timeout_ms: task.timeout_ms,
                dispatched_at: now,
            },
        );

        let event = RunTaskEvent {
            domain: task.domain.clone(),
            task_id: task.task_id.clone(),
            graph_id: task.graph_id.clone(),
            attempt: task.attempt,
        };
        if let Err(e) = self.messenger.publish_run_task(&event).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to publish run-task; returning task to ready");
            self.in_flight.remove(&task.task_id);
            self.store
                .transition_task(
                    &task.task_id,
                    task.attempt,
                    &[TaskState::Leased],
                    TaskState::Ready,
                )
                .await?;
            self.store.release_lease(&task.task_id).await?;
            return Ok(false);
        }

        self.store
            .mark_dispatched(&task.task_id, task.attempt, now)
            .await?;
        bump(&self.stats.tasks_queued);
        debug!(
            task_id = %task.task_id,
            graph_id = %task.graph_id,
            label = %task.label,
            run_job = %task.run_job,
            attempt = task.attempt,
            "Task dispatched"
        );
        Ok(true)
    }

    /// Apply a task-finished event.
    pub async fn handle_task_finished(&self, event: &TaskFinishedEvent) -> Result<()> {
        self.in_flight
            .remove_if(&event.task_id, |_, entry| entry.attempt == event.attempt);

        if !event.state.is_terminal() {
            warn!(task_id = %event.task_id, state = %event.state, "Ignoring non-terminal result");
            return Ok(());
        }

        let task = match self.store.get_task(&event.task_id).await? {
            Some(task) if task.attempt == event.attempt && !task.state.is_terminal() => task,
            Some(task) => {
                bump(&self.stats.stale_results);
                debug!(
                    task_id = %event.task_id,
                    event_attempt = event.attempt,
                    stored_attempt = task.attempt,
                    state = %task.state,
                    "Discarding stale result"
                );
                return Ok(());
            }
            None => {
                debug!(task_id = %event.task_id, "Result for unknown task");
                return Ok(());
            }
        };

        self.settle(&task, event.state, event.detail.clone(), event.stats.started)
            .await
    }

    async fn settle(
        &self,
        task: &TaskInstance,
        outcome: TaskState,
        detail: Option<Value>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.config.retry_policy.should_retry(task, outcome)
            && self.store.retry_task(&task.task_id, task.attempt).await?
        {
            bump(&self.stats.tasks_retried);
            self.store.release_lease(&task.task_id).await?;
            info!(
                task_id = %task.task_id,
                graph_id = %task.graph_id,
                outcome = %outcome,
                retry = task.retries_attempted + 1,
                retries_allowed = task.retries_allowed,
                "Retrying task"
            );
            return Ok(());
        }

        let finished = FinishedTask {
            task_id: task.task_id.clone(),
            graph_id: task.graph_id.clone(),
            domain: task.domain.clone(),
            attempt: task.attempt,
            state: outcome,
            detail,
            started_at,
            finished_at: Utc::now(),
        };
        if !self.store.finish_task(&finished).await? {
            bump(&self.stats.stale_results);
            debug!(task_id = %task.task_id, "Result lost the race to another writer");
            return Ok(());
        }

        match outcome {
            TaskState::Succeeded => bump(&self.stats.tasks_succeeded),
            TaskState::Failed => bump(&self.stats.tasks_failed),
            TaskState::Timeout => bump(&self.stats.tasks_timed_out),
            TaskState::Cancelled => bump(&self.stats.tasks_cancelled),
            _ => {}
        }
        self.store.release_lease(&task.task_id).await?;

        info!(
            task_id = %task.task_id,
            graph_id = %task.graph_id,
            label = %task.label,
            state = %outcome,
            "Task settled"
        );
        Ok(())
    }

    /// Apply a cancel-graph event.
    ///
    /// Events without a graph id are ignored. Pending and ready nodes are
    /// recorded `cancelled`; in-flight nodes get a cancel-task and settle
    /// when their runner reports back.
    pub async fn handle_cancel_graph(&self, event: &CancelGraphEvent) -> Result<()> {
        let Some(graph_id) = event.graph_id.as_deref() else {
            warn!("cancel-graph without graphId ignored");
            return Ok(());
        };
        let Some(graph) = self.store.get_graph(graph_id).await? else {
            debug!(graph_id = %graph_id, "cancel-graph for unknown graph");
            return Ok(());
        };
        if graph.domain != self.config.domain {
            return Ok(());
        }

        let mut cancelled = 0usize;
        let mut signalled = 0usize;
        for task in graph.tasks.values() {
            match task.state {
                TaskState::Pending | TaskState::Ready => {
                    self.settle_cancelled(task).await?;
                    cancelled += 1;
                }
                TaskState::Leased | TaskState::Dispatched => {
                    self.messenger
                        .publish_cancel_task(&CancelTaskEvent {
                            task_id: task.task_id.clone(),
                        })
                        .await?;
                    signalled += 1;
                }
                _ => {}
            }
        }

        info!(
            graph_id = %graph_id,
            cancelled,
            signalled,
            "Graph cancellation requested"
        );
        Ok(())
    }

    async fn settle_cancelled(&self, task: &TaskInstance) -> Result<()> {
        let finished = FinishedTask {
            task_id: task.task_id.clone(),
            graph_id: task.graph_id.clone(),
            domain: task.domain.clone(),
            attempt: task.attempt,
            state: TaskState::Cancelled,
            detail: None,
            started_at: None,
            finished_at: Utc::now(),
        };
        if self.store.finish_task(&finished).await? {
            bump(&self.stats.tasks_cancelled);
        }
        Ok(())
    }

    async fn release_all(&self) {
        let held: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for task_id in held {
            if let Err(e) = self.store.release_lease(&task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to release lease on shutdown");
            }
        }
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskOptions;

    fn task(retries_attempted: u32, retries_allowed: u32) -> TaskInstance {
        TaskInstance {
            task_id: "t".to_string(),
            graph_id: "g".to_string(),
            label: "a".to_string(),
            domain: "default".to_string(),
            injectable_name: "Task.Noop".to_string(),
            run_job: "noop".to_string(),
            state: TaskState::Dispatched,
            attempt: 0,
            retries_attempted,
            retries_allowed,
            timeout_ms: -1,
            ignore_failure: false,
            waiting_on: vec![],
            options: TaskOptions::new(),
            started_at: None,
            finished_at: None,
            detail: None,
        }
    }

    #[test]
    fn test_retry_policy_consumes_allowance() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&task(0, 2), TaskState::Failed));
        assert!(policy.should_retry(&task(1, 2), TaskState::Timeout));
        assert!(!policy.should_retry(&task(2, 2), TaskState::Failed));
        assert!(!policy.should_retry(&task(0, 2), TaskState::Succeeded));
        assert!(!policy.should_retry(&task(0, 2), TaskState::Cancelled));
    }

    #[test]
    fn test_retry_policy_without_timeouts() {
        let policy = RetryPolicy {
            retry_failed: true,
            retry_timeout: false,
        };
        assert!(policy.should_retry(&task(0, 1), TaskState::Failed));
        assert!(!policy.should_retry(&task(0, 1), TaskState::Timeout));
    }

    #[test]
    fn test_stats_snapshot_wire_names() {
        let value = serde_json::to_value(SchedulerStatsSnapshot::default()).unwrap();
        for key in [
            "tasksQueued",
            "tasksSucceeded",
            "tasksFailed",
            "tasksTimedOut",
            "tasksCancelled",
            "tasksRetried",
            "maxConcurrentExceeded",
            "leaseConflicts",
            "staleResults",
        ] {
            assert_eq!(value[key], 0, "{}", key);
        }
    }
}
