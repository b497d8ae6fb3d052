// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task kind trait definitions.
//!
//! A task kind is the code behind a definition's `runJob`. Runners look the
//! kind up by name in a [`TaskKindCatalog`] and call
//! [`TaskKind::execute`] once per dispatched attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::graph::TaskOptions;

/// Errors returned by a task kind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// A required option is missing or has the wrong shape.
    #[error("Invalid option '{key}': {reason}")]
    InvalidOption {
        /// Option key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The task ran and failed.
    #[error("Task failed: {0}")]
    Failed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Payload reported as the task's `detail`.
    pub fn detail(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Everything a task kind gets to know about the attempt it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task id.
    pub task_id: String,
    /// Owning graph instance.
    pub graph_id: String,
    /// Node label.
    pub label: String,
    /// Scheduling domain.
    pub domain: String,
    /// Dispatch generation.
    pub attempt: u32,
    /// Data shared by every task of the graph.
    pub graph_context: Value,
    /// Cancelled when a cancel-task arrives or the runner shuts down.
    pub cancellation: CancellationToken,
}

/// Executable unit behind a `runJob` name.
///
/// Implementations should watch `context.cancellation` if they run for long;
/// the runner stops awaiting them as soon as it fires either way.
#[async_trait]
pub trait TaskKind: Send + Sync {
    /// Name matched against `runJob`.
    fn name(&self) -> &str;

    /// Run one attempt. `Ok(detail)` reports `succeeded`.
    async fn execute(
        &self,
        options: &TaskOptions,
        context: &TaskContext,
    ) -> Result<Option<Value>, TaskError>;
}

/// Task kinds available to a runner, keyed by name.
#[derive(Clone, Default)]
pub struct TaskKindCatalog {
    kinds: HashMap<String, Arc<dyn TaskKind>>,
}

impl TaskKindCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in `noop` and `sleep` kinds.
    pub fn with_builtin() -> Self {
        Self::new()
            .with(super::builtin::NoopKind)
            .with(super::builtin::SleepKind)
    }

    /// Add a kind, replacing any kind registered under the same name.
    pub fn register(&mut self, kind: Arc<dyn TaskKind>) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, kind: impl TaskKind + 'static) -> Self {
        self.register(Arc::new(kind));
        self
    }

    /// Look up a kind.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskKind>> {
        self.kinds.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TaskKindCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskKindCatalog")
            .field("kinds", &self.names())
            .finish()
    }
}
