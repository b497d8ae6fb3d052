// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Store backing selected by `TASKGRAPH_STORE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Process-local store.
    Memory,
    /// SQLite database at `TASKGRAPH_DATABASE_URL`.
    Sqlite,
}

/// Messenger backing selected by `TASKGRAPH_MESSENGER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerKind {
    /// In-process topic broker.
    Broker,
    /// Polling of the store's task event log.
    StoragePoll,
}

/// taskgraph-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backing
    pub store: StoreKind,
    /// SQLite connection URL (required for the sqlite store)
    pub database_url: Option<String>,
    /// Messenger backing
    pub messenger: MessengerKind,
    /// Scheduling domain served by this process
    pub domain: String,
    /// Maximum tasks in flight per scheduler
    pub concurrent_tasks: usize,
    /// Lease duration in milliseconds
    pub lease_adjust_ms: u64,
    /// Default task timeout in milliseconds, `-1` for unbounded
    pub task_timeout_ms: i64,
    /// Poll interval for the storage messenger and completed task poller
    pub poll_interval_ms: u64,
    /// Whether timed-out tasks consume retries
    pub retry_on_timeout: bool,
    /// Age in milliseconds after which task event log records are deleted
    pub event_retention_ms: u64,
    /// Optional definition manifest
    pub manifest_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            database_url: None,
            messenger: MessengerKind::Broker,
            domain: "default".to_string(),
            concurrent_tasks: 3,
            lease_adjust_ms: 60_000,
            task_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            retry_on_timeout: true,
            event_retention_ms: 3_600_000,
            manifest_path: None,
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TASKGRAPH_STORE`: `memory` or `sqlite` (default: memory)
    /// - `TASKGRAPH_DATABASE_URL`: SQLite URL, required when the store is sqlite
    /// - `TASKGRAPH_MESSENGER`: `broker` or `storage-poll` (default: broker)
    /// - `TASKGRAPH_DOMAIN`: scheduling domain (default: default)
    /// - `TASKGRAPH_CONCURRENT_TASKS`: in-flight cap (default: 3)
    /// - `TASKGRAPH_LEASE_ADJUST_MS`: lease duration (default: 60000)
    /// - `TASKGRAPH_TASK_TIMEOUT_MS`: default task timeout, -1 unbounded (default: 10000)
    /// - `TASKGRAPH_POLL_INTERVAL_MS`: polling interval (default: 1000)
    /// - `TASKGRAPH_RETRY_ON_TIMEOUT`: timeouts consume retries (default: true)
    /// - `TASKGRAPH_EVENT_RETENTION_MS`: task event log retention (default: 3600000)
    /// - `TASKGRAPH_MANIFEST_PATH`: definition manifest file
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store = match var("TASKGRAPH_STORE").as_deref() {
            None | Some("memory") => StoreKind::Memory,
            Some("sqlite") => StoreKind::Sqlite,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "TASKGRAPH_STORE",
                    "must be 'memory' or 'sqlite'",
                ));
            }
        };

        let database_url = var("TASKGRAPH_DATABASE_URL");
        if store == StoreKind::Sqlite && database_url.is_none() {
            return Err(ConfigError::Missing("TASKGRAPH_DATABASE_URL"));
        }

        let messenger = match var("TASKGRAPH_MESSENGER").as_deref() {
            None | Some("broker") => MessengerKind::Broker,
            Some("storage-poll") => MessengerKind::StoragePoll,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "TASKGRAPH_MESSENGER",
                    "must be 'broker' or 'storage-poll'",
                ));
            }
        };

        let domain = var("TASKGRAPH_DOMAIN").unwrap_or(defaults.domain);

        let concurrent_tasks: usize = var("TASKGRAPH_CONCURRENT_TASKS")
            .unwrap_or_else(|| defaults.concurrent_tasks.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TASKGRAPH_CONCURRENT_TASKS",
                "must be a positive integer",
            ))?;

        let lease_adjust_ms: u64 = var("TASKGRAPH_LEASE_ADJUST_MS")
            .unwrap_or_else(|| defaults.lease_adjust_ms.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TASKGRAPH_LEASE_ADJUST_MS",
                "must be a positive number of milliseconds",
            ))?;

        let task_timeout_ms: i64 = var("TASKGRAPH_TASK_TIMEOUT_MS")
            .unwrap_or_else(|| defaults.task_timeout_ms.to_string())
            .parse()
            .ok()
            .filter(|n| *n == -1 || *n > 0)
            .ok_or(ConfigError::Invalid(
                "TASKGRAPH_TASK_TIMEOUT_MS",
                "must be -1 or a positive number of milliseconds",
            ))?;

        let poll_interval_ms: u64 = var("TASKGRAPH_POLL_INTERVAL_MS")
            .unwrap_or_else(|| defaults.poll_interval_ms.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TASKGRAPH_POLL_INTERVAL_MS",
                "must be a positive number of milliseconds",
            ))?;

        let retry_on_timeout = match var("TASKGRAPH_RETRY_ON_TIMEOUT").as_deref() {
            None => defaults.retry_on_timeout,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "TASKGRAPH_RETRY_ON_TIMEOUT",
                    "must be true or false",
                ));
            }
        };

        let event_retention_ms: u64 = var("TASKGRAPH_EVENT_RETENTION_MS")
            .unwrap_or_else(|| defaults.event_retention_ms.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TASKGRAPH_EVENT_RETENTION_MS",
                "must be a positive number of milliseconds",
            ))?;

        let manifest_path = var("TASKGRAPH_MANIFEST_PATH").map(PathBuf::from);

        Ok(Self {
            store,
            database_url,
            messenger,
            domain,
            concurrent_tasks,
            lease_adjust_ms,
            task_timeout_ms,
            poll_interval_ms,
            retry_on_timeout,
            event_retention_ms,
            manifest_path,
        })
    }

    /// Lease duration.
    pub fn lease_adjust(&self) -> Duration {
        Duration::from_millis(self.lease_adjust_ms)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Task event log retention.
    pub fn event_retention(&self) -> Duration {
        Duration::from_millis(self.event_retention_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
