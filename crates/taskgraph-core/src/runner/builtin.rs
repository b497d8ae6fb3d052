// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in task kinds.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::traits::{TaskContext, TaskError, TaskKind};
use crate::graph::TaskOptions;

/// Succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopKind;

#[async_trait]
impl TaskKind for NoopKind {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(
        &self,
        _options: &TaskOptions,
        context: &TaskContext,
    ) -> Result<Option<Value>, TaskError> {
        debug!(task_id = %context.task_id, label = %context.label, "noop");
        Ok(None)
    }
}

/// Sleeps for `durationMs` (default 0), then succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepKind;

#[async_trait]
impl TaskKind for SleepKind {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(
        &self,
        options: &TaskOptions,
        context: &TaskContext,
    ) -> Result<Option<Value>, TaskError> {
        let duration_ms = match options.get("durationMs") {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_u64().ok_or_else(|| TaskError::InvalidOption {
                key: "durationMs".to_string(),
                reason: "must be a non-negative integer".to_string(),
            })?,
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
            _ = context.cancellation.cancelled() => {}
        }
        Ok(Some(json!({ "sleptMs": duration_ms })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn context() -> TaskContext {
        TaskContext {
            task_id: "t1".to_string(),
            graph_id: "g1".to_string(),
            label: "sleep".to_string(),
            domain: "default".to_string(),
            attempt: 0,
            graph_context: Value::Null,
            cancellation: CancellationToken::new(),
        }
    }

    fn options(value: Value) -> TaskOptions {
        match value {
            Value::Object(map) => map,
            _ => TaskOptions::new(),
        }
    }

    #[tokio::test]
    async fn test_noop_succeeds() {
        let detail = NoopKind
            .execute(&TaskOptions::new(), &context())
            .await
            .unwrap();
        assert!(detail.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waits_for_duration() {
        let started = tokio::time::Instant::now();
        let detail = SleepKind
            .execute(&options(json!({ "durationMs": 250 })), &context())
            .await
            .unwrap();
        assert_eq!(detail, Some(json!({ "sleptMs": 250 })));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_duration() {
        let err = SleepKind
            .execute(&options(json!({ "durationMs": "soon" })), &context())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn test_sleep_stops_on_cancellation() {
        let context = context();
        context.cancellation.cancel();
        let detail = SleepKind
            .execute(&options(json!({ "durationMs": 60_000 })), &context)
            .await
            .unwrap();
        assert!(detail.is_some());
    }
}
