// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service graph reconciliation.
//!
//! Service graphs are long-running graphs that should always have exactly one
//! live instance per definition. [`ServiceGraphManager::start`] is a full
//! diff-and-converge pass over the registry's service-graph definitions and the
//! stored service-graph instances of a domain:
//!
//! | Stored instance | Definition | Action |
//! |-----------------|------------|--------|
//! | none | present | create |
//! | live, same content | present | leave |
//! | live, different content | present | cancel, delete, create |
//! | live | removed | cancel, delete |
//! | finalized (failed, cancelled, ...) | present | delete, create |
//! | finalized | removed | delete |
//!
//! [`run`](ServiceGraphManager::run) repeats the pass on an interval so a
//! service graph that finishes is restarted without outside help.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::graph::{BuildOptions, GraphDefinition, GraphInstance};
use crate::messenger::{CancelGraphEvent, CancelTaskEvent, Messenger};
use crate::registry::Registry;
use crate::store::Store;

/// Configuration for the service graph manager.
#[derive(Debug, Clone)]
pub struct ServiceGraphManagerConfig {
    /// Domain service graphs are created in.
    pub domain: String,
    /// Interval between reconcile passes in [`ServiceGraphManager::run`].
    pub reconcile_interval: Duration,
    /// Default task timeout for created instances (`-1` unbounded).
    pub default_timeout_ms: i64,
}

impl Default for ServiceGraphManagerConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            reconcile_interval: Duration::from_secs(30),
            default_timeout_ms: -1,
        }
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Instances created for definitions that had none.
    pub started: usize,
    /// Instances created to replace a changed or finalized one.
    pub restarted: usize,
    /// Live instances cancelled because their definition changed or vanished.
    pub cancelled: usize,
    /// Live instances left running.
    pub unchanged: usize,
}

/// Keeps one live instance per service-graph definition.
pub struct ServiceGraphManager {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<Registry>,
    config: ServiceGraphManagerConfig,
    /// definition name → instance id
    tracked: DashMap<String, String>,
    shutdown: Arc<Notify>,
}

impl ServiceGraphManager {
    /// Create a new service graph manager.
    pub fn new(
        store: Arc<dyn Store>,
        messenger: Arc<dyn Messenger>,
        registry: Arc<Registry>,
        config: ServiceGraphManagerConfig,
    ) -> Self {
        Self {
            store,
            messenger,
            registry,
            config,
            tracked: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Instance ids currently tracked, keyed by definition name.
    pub fn tracked(&self) -> HashMap<String, String> {
        self.tracked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Reconcile on an interval until shutdown, then stop every tracked
    /// instance.
    pub async fn run(&self) {
        info!(
            domain = %self.config.domain,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Service graph manager started"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Service graph manager received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    match self.start(&self.config.domain).await {
                        Ok(summary) if summary.started + summary.restarted + summary.cancelled > 0 => {
                            info!(?summary, "Service graphs reconciled");
                        }
                        Ok(_) => debug!("Service graphs up to date"),
                        Err(e) if e.is_rejection() => {
                            warn!(error = %e, "Service graph definition rejected");
                        }
                        Err(e) => error!(error = %e, "Failed to reconcile service graphs"),
                    }
                }
            }
        }

        if let Err(e) = self.stop().await {
            error!(error = %e, "Failed to stop service graphs");
        }
        info!("Service graph manager stopped");
    }

    /// One diff-and-converge pass for `domain`.
    pub async fn start(&self, domain: &str) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let definitions: HashMap<String, GraphDefinition> = self
            .registry
            .fetch_graph_definition_catalog()
            .into_iter()
            .filter(|definition| definition.service_graph)
            .map(|definition| (definition.injectable_name.clone(), definition))
            .collect();

        let mut instances: HashMap<String, Vec<GraphInstance>> = HashMap::new();
        for instance in self.store.find_service_graphs().await? {
            if instance.domain == domain {
                instances
                    .entry(instance.injectable_name.clone())
                    .or_default()
                    .push(instance);
            }
        }

        for (name, stale) in instances.iter().filter(|(name, _)| !definitions.contains_key(*name)) {
            for instance in stale {
                if !instance.status.is_terminal() {
                    summary.cancelled += 1;
                }
                self.cancel_and_delete(instance).await?;
            }
            self.tracked.remove(name);
            info!(graph = %name, "Service graph definition removed; instance cancelled");
        }

        let mut names: Vec<&String> = definitions.keys().collect();
        names.sort();
        for name in names {
            let definition = &definitions[name];
            let existing = instances.remove(name).unwrap_or_default();
            let replaced = !existing.is_empty();

            let mut keep: Option<String> = None;
            for instance in existing {
                let live = !instance.status.is_terminal();
                if live && keep.is_none() && instance.definition == *definition {
                    keep = Some(instance.instance_id.clone());
                    continue;
                }
                if live {
                    summary.cancelled += 1;
                    info!(
                        graph = %name,
                        graph_id = %instance.instance_id,
                        "Service graph definition changed; cancelling instance"
                    );
                } else {
                    warn!(
                        graph = %name,
                        graph_id = %instance.instance_id,
                        status = %instance.status,
                        "Service graph finished; restarting"
                    );
                }
                self.cancel_and_delete(&instance).await?;
            }

            match keep {
                Some(instance_id) => {
                    summary.unchanged += 1;
                    self.tracked.insert(name.clone(), instance_id);
                }
                None => {
                    let instance_id = self.create(name, domain).await?;
                    self.tracked.insert(name.clone(), instance_id);
                    if replaced {
                        summary.restarted += 1;
                    } else {
                        summary.started += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Cancel every tracked instance. Records are kept; the next
    /// [`start`](Self::start) replaces the finalized instances.
    pub async fn stop(&self) -> Result<usize> {
        let tracked: Vec<(String, String)> = self
            .tracked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut stopped = 0;
        for (name, instance_id) in tracked {
            if let Some(graph) = self.store.get_graph(&instance_id).await? {
                self.cancel(&graph).await?;
                stopped += 1;
                info!(graph = %name, graph_id = %instance_id, "Service graph stopped");
            }
            self.tracked.remove(&name);
        }
        Ok(stopped)
    }

    async fn create(&self, name: &str, domain: &str) -> Result<String> {
        let options = BuildOptions {
            domain: domain.to_string(),
            default_timeout_ms: self.config.default_timeout_ms,
            ..BuildOptions::default()
        };
        // service graphs run until cancelled; nothing awaits the completion
        let (graph, _completion) = self.registry.create_graph(name, options).await?;
        info!(graph = %name, graph_id = %graph.instance_id, domain = %domain, "Service graph started");
        Ok(graph.instance_id)
    }

    async fn cancel(&self, graph: &GraphInstance) -> Result<()> {
        for task in graph.tasks.values().filter(|task| task.state.is_in_flight()) {
            self.messenger
                .publish_cancel_task(&CancelTaskEvent {
                    task_id: task.task_id.clone(),
                })
                .await?;
        }
        self.messenger
            .publish_cancel_graph(&CancelGraphEvent {
                graph_id: Some(graph.instance_id.clone()),
            })
            .await
    }

    async fn cancel_and_delete(&self, graph: &GraphInstance) -> Result<()> {
        if !graph.status.is_terminal() {
            self.cancel(graph).await?;
        }
        self.store.delete_graph(&graph.instance_id).await?;
        self.registry.remove_active_graph(&graph.instance_id);
        Ok(())
    }
}
