// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime wiring every worker of one domain.
//!
//! [`TaskGraphRuntime`] runs the scheduler, task runner, lease expiration
//! poller, completed task poller and (optionally) the service graph manager
//! inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskgraph_core::manifest::DefinitionManifest;
//! use taskgraph_core::registry::Registry;
//! use taskgraph_core::runtime::TaskGraphRuntime;
//! use taskgraph_core::store::{MemoryStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//!     let registry = Arc::new(Registry::new(store.clone()));
//!     registry.load(&DefinitionManifest::builtin()).await?;
//!
//!     let runtime = TaskGraphRuntime::builder()
//!         .store(store)
//!         .registry(registry.clone())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let (_graph, completion) = registry
//!         .create_graph("Graph.Noop", runtime.build_options())
//!         .await?;
//!     let status = completion.await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::completed_task_poller::{CompletedTaskPoller, CompletedTaskPollerConfig};
use crate::config::Config;
use crate::graph::BuildOptions;
use crate::lease_expiration_poller::{LeaseExpirationPoller, LeaseExpirationPollerConfig};
use crate::messenger::{BrokerMessenger, Messenger};
use crate::registry::Registry;
use crate::runner::{TaskKind, TaskKindCatalog, TaskRunner, TaskRunnerConfig};
use crate::scheduler::{RetryPolicy, Scheduler, SchedulerConfig, SchedulerStatsSnapshot};
use crate::service_graph::{ServiceGraphManager, ServiceGraphManagerConfig};
use crate::store::Store;

/// Builder for creating a [`TaskGraphRuntime`].
pub struct TaskGraphRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    messenger: Option<Arc<dyn Messenger>>,
    registry: Option<Arc<Registry>>,
    kinds: TaskKindCatalog,
    domain: String,
    scheduler_id: Option<String>,
    concurrent_tasks: usize,
    lease_adjust: Duration,
    poll_interval: Duration,
    lease_poll_interval: Option<Duration>,
    event_retention: Duration,
    retry_policy: RetryPolicy,
    task_timeout_ms: i64,
    service_graphs: bool,
    service_reconcile_interval: Duration,
}

impl std::fmt::Debug for TaskGraphRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraphRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("messenger", &self.messenger.as_ref().map(|_| "..."))
            .field("registry", &self.registry.as_ref().map(|_| "..."))
            .field("kinds", &self.kinds)
            .field("domain", &self.domain)
            .field("concurrent_tasks", &self.concurrent_tasks)
            .field("lease_adjust", &self.lease_adjust)
            .field("poll_interval", &self.poll_interval)
            .field("retry_policy", &self.retry_policy)
            .field("service_graphs", &self.service_graphs)
            .finish()
    }
}

impl Default for TaskGraphRuntimeBuilder {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            store: None,
            messenger: None,
            registry: None,
            kinds: TaskKindCatalog::with_builtin(),
            domain: scheduler.domain,
            scheduler_id: None,
            concurrent_tasks: scheduler.concurrent_tasks,
            lease_adjust: scheduler.lease_adjust,
            poll_interval: scheduler.poll_interval,
            lease_poll_interval: None,
            event_retention: LeaseExpirationPollerConfig::default().event_retention,
            retry_policy: scheduler.retry_policy,
            task_timeout_ms: 10_000,
            service_graphs: true,
            service_reconcile_interval: ServiceGraphManagerConfig::default().reconcile_interval,
        }
    }
}

impl TaskGraphRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            domain: config.domain.clone(),
            concurrent_tasks: config.concurrent_tasks,
            lease_adjust: config.lease_adjust(),
            poll_interval: config.poll_interval(),
            event_retention: config.event_retention(),
            retry_policy: RetryPolicy {
                retry_failed: true,
                retry_timeout: config.retry_on_timeout,
            },
            task_timeout_ms: config.task_timeout_ms,
            ..Self::default()
        }
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the messenger (default: an in-process broker).
    pub fn messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Set the registry (default: an empty registry over the store).
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the task kind catalog (default: the built-in kinds).
    pub fn task_kinds(mut self, kinds: TaskKindCatalog) -> Self {
        self.kinds = kinds;
        self
    }

    /// Add one task kind to the catalog.
    pub fn task_kind(mut self, kind: impl TaskKind + 'static) -> Self {
        self.kinds.register(Arc::new(kind));
        self
    }

    /// Set the scheduling domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the lease owner id (default: random).
    pub fn scheduler_id(mut self, scheduler_id: impl Into<String>) -> Self {
        self.scheduler_id = Some(scheduler_id.into());
        self
    }

    /// Set the in-flight cap.
    pub fn concurrent_tasks(mut self, concurrent_tasks: usize) -> Self {
        self.concurrent_tasks = concurrent_tasks;
        self
    }

    /// Set the lease duration.
    pub fn lease_adjust(mut self, lease_adjust: Duration) -> Self {
        self.lease_adjust = lease_adjust;
        self
    }

    /// Set the scheduler and completed task poller interval.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the lease expiration interval (default: `2 × lease_adjust`).
    pub fn lease_poll_interval(mut self, interval: Duration) -> Self {
        self.lease_poll_interval = Some(interval);
        self
    }

    /// Set how long task event log records are kept.
    pub fn event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }

    /// Set the retry policy.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Enable or disable the service graph manager (default: enabled).
    pub fn service_graphs(mut self, enabled: bool) -> Self {
        self.service_graphs = enabled;
        self
    }

    /// Set the service graph reconcile interval.
    pub fn service_reconcile_interval(mut self, interval: Duration) -> Self {
        self.service_reconcile_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TaskGraphRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.concurrent_tasks == 0 {
            anyhow::bail!("concurrent_tasks must be positive");
        }
        if self.lease_adjust.is_zero() {
            anyhow::bail!("lease_adjust must be positive");
        }

        let messenger = self
            .messenger
            .unwrap_or_else(|| Arc::new(BrokerMessenger::default()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(Registry::new(store.clone())));

        Ok(TaskGraphRuntimeConfig {
            store,
            messenger,
            registry,
            kinds: Arc::new(self.kinds),
            scheduler: SchedulerConfig {
                domain: self.domain.clone(),
                scheduler_id: self
                    .scheduler_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                concurrent_tasks: self.concurrent_tasks,
                lease_adjust: self.lease_adjust,
                poll_interval: self.poll_interval,
                retry_policy: self.retry_policy,
            },
            lease_poller: LeaseExpirationPollerConfig {
                event_retention: self.event_retention,
                ..match self.lease_poll_interval {
                    Some(poll_interval) => LeaseExpirationPollerConfig {
                        poll_interval,
                        ..LeaseExpirationPollerConfig::default()
                    },
                    None => LeaseExpirationPollerConfig::for_lease_adjust(self.lease_adjust),
                }
            },
            completed_poller: CompletedTaskPollerConfig {
                domain: self.domain.clone(),
                poll_interval: self.poll_interval,
                ..CompletedTaskPollerConfig::default()
            },
            service_graphs: self.service_graphs.then(|| ServiceGraphManagerConfig {
                domain: self.domain.clone(),
                reconcile_interval: self.service_reconcile_interval,
                default_timeout_ms: -1,
            }),
            task_timeout_ms: self.task_timeout_ms,
        })
    }
}

/// Configuration for a [`TaskGraphRuntime`].
pub struct TaskGraphRuntimeConfig {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<Registry>,
    kinds: Arc<TaskKindCatalog>,
    scheduler: SchedulerConfig,
    lease_poller: LeaseExpirationPollerConfig,
    completed_poller: CompletedTaskPollerConfig,
    service_graphs: Option<ServiceGraphManagerConfig>,
    task_timeout_ms: i64,
}

impl std::fmt::Debug for TaskGraphRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraphRuntimeConfig")
            .field("store", &self.store.backend())
            .field("messenger", &self.messenger.backend())
            .field("registry", &"...")
            .field("kinds", &self.kinds)
            .field("scheduler", &self.scheduler)
            .field("lease_poller", &self.lease_poller)
            .field("completed_poller", &self.completed_poller)
            .field("service_graphs", &self.service_graphs)
            .finish()
    }
}

struct Worker {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            error!("{} task panicked: {}", self.name, e);
        }
    }
}

impl TaskGraphRuntimeConfig {
    /// Start the runtime, spawning every worker.
    ///
    /// Subscriptions are established before any worker runs, so nothing
    /// dispatched after `start` returns can be missed.
    pub async fn start(self) -> Result<TaskGraphRuntime> {
        self.messenger.start().await?;

        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            self.messenger.clone(),
            self.scheduler.clone(),
        ));
        let runner = TaskRunner::new(
            self.store.clone(),
            self.messenger.clone(),
            self.kinds.clone(),
            TaskRunnerConfig {
                domain: self.scheduler.domain.clone(),
            },
        );
        let lease_poller = LeaseExpirationPoller::new(self.store.clone(), self.lease_poller);
        let completed_poller = CompletedTaskPoller::new(
            self.store.clone(),
            self.messenger.clone(),
            self.registry.clone(),
            self.completed_poller,
        );

        let scheduler_subscriptions = scheduler.subscribe().await?;
        let runner_subscription = runner.subscribe().await?;
        let completed_subscription = completed_poller.subscribe().await?;

        let runner_worker = Worker {
            name: "Task runner",
            shutdown: runner.shutdown_handle(),
            handle: tokio::spawn(async move {
                runner.run_with(runner_subscription).await;
            }),
        };

        let scheduler_worker = {
            let scheduler = scheduler.clone();
            Worker {
                name: "Scheduler",
                shutdown: scheduler.shutdown_handle(),
                handle: tokio::spawn(async move {
                    scheduler.run_with(scheduler_subscriptions).await;
                }),
            }
        };

        let lease_worker = Worker {
            name: "Lease expiration poller",
            shutdown: lease_poller.shutdown_handle(),
            handle: tokio::spawn(async move {
                lease_poller.run().await;
            }),
        };

        let completed_worker = Worker {
            name: "Completed task poller",
            shutdown: completed_poller.shutdown_handle(),
            handle: tokio::spawn(async move {
                completed_poller.run_with(Some(completed_subscription)).await;
            }),
        };

        let service_worker = self.service_graphs.map(|config| {
            let manager = ServiceGraphManager::new(
                self.store.clone(),
                self.messenger.clone(),
                self.registry.clone(),
                config,
            );
            Worker {
                name: "Service graph manager",
                shutdown: manager.shutdown_handle(),
                handle: tokio::spawn(async move {
                    manager.run().await;
                }),
            }
        });

        info!(
            domain = %self.scheduler.domain,
            scheduler_id = %self.scheduler.scheduler_id,
            store = self.store.backend(),
            messenger = self.messenger.backend(),
            task_kinds = ?self.kinds.names(),
            service_graphs = service_worker.is_some(),
            "TaskGraphRuntime started"
        );

        Ok(TaskGraphRuntime {
            domain: self.scheduler.domain.clone(),
            task_timeout_ms: self.task_timeout_ms,
            store: self.store,
            messenger: self.messenger,
            registry: self.registry,
            scheduler,
            service_worker,
            workers: vec![
                runner_worker,
                scheduler_worker,
                completed_worker,
                lease_worker,
            ],
        })
    }
}

/// A running set of workers for one domain.
///
/// The runtime manages:
/// - Scheduler (leases, dispatch, retries, timeouts, cancel-graph)
/// - Task runner (executes dispatched tasks)
/// - Completed task poller (graph finalization)
/// - Lease expiration poller (reclaims abandoned leases)
/// - Service graph manager (optional)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TaskGraphRuntime {
    domain: String,
    task_timeout_ms: i64,
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    service_worker: Option<Worker>,
    workers: Vec<Worker>,
}

impl TaskGraphRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TaskGraphRuntimeBuilder {
        TaskGraphRuntimeBuilder::new()
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Get a reference to the messenger.
    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Get a reference to the registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Build options targeting this runtime's domain and default timeout.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            domain: self.domain.clone(),
            default_timeout_ms: self.task_timeout_ms,
            ..BuildOptions::default()
        }
    }

    /// Current scheduler counters.
    pub fn scheduler_stats(&self) -> SchedulerStatsSnapshot {
        self.scheduler.stats()
    }

    /// Gracefully shut down the runtime.
    ///
    /// The service graph manager stops first so its cancellations still reach
    /// a live scheduler and runner; the remaining workers stop afterwards.
    pub async fn shutdown(self) -> Result<()> {
        info!("TaskGraphRuntime shutting down...");

        if let Some(service_worker) = self.service_worker {
            service_worker.stop().await;
        }
        for worker in self.workers {
            worker.stop().await;
        }

        info!("TaskGraphRuntime shutdown complete");
        Ok(())
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers
            .iter()
            .chain(self.service_worker.iter())
            .all(|worker| !worker.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_builder_requires_store() {
        let err = TaskGraphRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let err = TaskGraphRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .concurrent_tasks(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("concurrent_tasks"));
    }

    #[test]
    fn test_builder_from_config() {
        let config = Config {
            domain: "lab".to_string(),
            concurrent_tasks: 7,
            lease_adjust_ms: 500,
            retry_on_timeout: false,
            event_retention_ms: 90_000,
            ..Config::default()
        };
        let runtime_config = TaskGraphRuntimeBuilder::from_config(&config)
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(runtime_config.scheduler.domain, "lab");
        assert_eq!(runtime_config.scheduler.concurrent_tasks, 7);
        assert!(!runtime_config.scheduler.retry_policy.retry_timeout);
        assert_eq!(
            runtime_config.lease_poller.poll_interval,
            Duration::from_millis(1000)
        );
        assert_eq!(
            runtime_config.lease_poller.event_retention,
            Duration::from_secs(90)
        );
        assert_eq!(runtime_config.completed_poller.domain, "lab");
        assert_eq!(runtime_config.task_timeout_ms, 10_000);
    }

    #[test]
    fn test_config_debug_hides_trait_objects() {
        let config = TaskGraphRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("memory"));
        assert!(debug.contains("broker"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = TaskGraphRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .poll_interval(Duration::from_millis(20))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert_eq!(runtime.build_options().domain, "default");
        assert_eq!(runtime.scheduler_stats(), SchedulerStatsSnapshot::default());
        runtime.shutdown().await.unwrap();
    }
}
