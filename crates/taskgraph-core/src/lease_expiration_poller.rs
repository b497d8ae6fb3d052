// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for reclaiming expired leases.
//!
//! A lease that its scheduler stopped renewing (crash, partition, shutdown
//! without release) blocks nothing once expired, but the record lingers. The
//! poller deletes such leases so the owning task shows up as orphaned and is
//! re-offered by the next scheduler tick. Deletion is conditional on the lease
//! still being expired, so a renewal racing the poller always wins.
//!
//! The same tick trims the `taskevents` log to the configured retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::store::Store;

/// Configuration for the lease expiration poller.
#[derive(Debug, Clone)]
pub struct LeaseExpirationPollerConfig {
    /// How often to look for expired leases.
    pub poll_interval: Duration,
    /// Maximum leases reclaimed per tick.
    pub batch_size: usize,
    /// Age after which `taskevents` records are deleted.
    pub event_retention: Duration,
}

impl Default for LeaseExpirationPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120), // 2 × default lease duration
            batch_size: 100,
            event_retention: Duration::from_secs(3600),
        }
    }
}

impl LeaseExpirationPollerConfig {
    /// Poll every `2 × lease_adjust`.
    pub fn for_lease_adjust(lease_adjust: Duration) -> Self {
        Self {
            poll_interval: lease_adjust * 2,
            ..Self::default()
        }
    }
}

/// Background worker that deletes expired leases.
pub struct LeaseExpirationPoller {
    store: Arc<dyn Store>,
    config: LeaseExpirationPollerConfig,
    shutdown: Arc<Notify>,
}

impl LeaseExpirationPoller {
    /// Create a new lease expiration poller.
    pub fn new(store: Arc<dyn Store>, config: LeaseExpirationPollerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poller loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            event_retention_secs = self.config.event_retention.as_secs(),
            "Lease expiration poller started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lease expiration poller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.expire_leases().await {
                        error!(error = %e, "Failed to expire leases");
                    }
                    if let Err(e) = self.prune_task_events().await {
                        error!(error = %e, "Failed to prune task events");
                    }
                }
            }
        }

        info!("Lease expiration poller stopped");
    }

    /// Delete every lease that expired before now. Returns how many were
    /// reclaimed.
    pub async fn expire_leases(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self
            .store
            .find_expired_leases(now, self.config.batch_size)
            .await?;
        if expired.is_empty() {
            debug!("No expired leases");
            return Ok(0);
        }

        let mut reclaimed = 0;
        for lease in expired {
            match self.store.expire_lease(&lease.task_id, now).await {
                Ok(true) => {
                    reclaimed += 1;
                    info!(
                        task_id = %lease.task_id,
                        scheduler_id = %lease.scheduler_id,
                        expired_at = %lease.expires_at,
                        "Expired lease reclaimed"
                    );
                }
                Ok(false) => {
                    debug!(task_id = %lease.task_id, "Lease renewed before reclaim");
                }
                Err(e) => {
                    error!(task_id = %lease.task_id, error = %e, "Failed to reclaim lease");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Delete `taskevents` records older than the retention.
    pub async fn prune_task_events(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.event_retention)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let pruned = self.store.prune_task_events(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, cutoff = %cutoff, "Task events pruned");
        }
        Ok(pruned)
    }
}
