// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! taskgraph-core - standalone worker process
//!
//! Runs the scheduler, task runner, pollers and service graph manager for one
//! domain until ctrl-c.

use std::sync::Arc;
use tracing::{info, warn};

use taskgraph_core::config::{Config, StoreKind};
use taskgraph_core::manifest::DefinitionManifest;
use taskgraph_core::messenger;
use taskgraph_core::registry::Registry;
use taskgraph_core::runtime::TaskGraphRuntimeBuilder;
use taskgraph_core::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskgraph_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        domain = %config.domain,
        store = ?config.store,
        messenger = ?config.messenger,
        concurrent_tasks = config.concurrent_tasks,
        "Starting taskgraph-core"
    );

    let store: Arc<dyn Store> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("TASKGRAPH_DATABASE_URL is required"))?;
            let store = SqliteStore::connect(url).await?;
            info!("Connected to database");
            Arc::new(store)
        }
    };

    let mut manifest = DefinitionManifest::builtin();
    if let Some(path) = &config.manifest_path {
        let extra = DefinitionManifest::from_path(path)?;
        info!(path = %path.display(), definitions = extra.len(), "Manifest loaded");
        manifest = manifest.merge(extra);
    }

    let registry = Arc::new(Registry::new(store.clone()));
    registry.load(&manifest).await?;

    let messenger = messenger::from_config(&config, store.clone());

    let runtime = TaskGraphRuntimeBuilder::from_config(&config)
        .store(store)
        .messenger(messenger)
        .registry(registry)
        .build()?
        .start()
        .await?;

    info!(domain = %config.domain, "taskgraph-core ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("taskgraph-core shut down");

    Ok(())
}
