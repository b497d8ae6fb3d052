// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{
    CompletedTaskRecord, FinishedTask, Lease, Store, TaskEventAction, TaskEventRecord,
};
use crate::error::{Error, Result};
use crate::graph::{
    GraphDefinition, GraphInstance, GraphStatus, TaskDefinition, TaskInstance, TaskState,
};
use crate::migrations;

const TERMINAL_STATES: &str = "('succeeded', 'failed', 'timeout', 'cancelled')";
const LIVE_GRAPH_STATUSES: &str = "('pending', 'running')";

fn corrupt(what: &str, err: impl std::fmt::Display) -> Error {
    Error::CorruptRecord(format!("{}: {}", what, err))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt("lease timestamp", ms))
}

#[derive(sqlx::FromRow)]
struct GraphRow {
    status: String,
    document: String,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    state: String,
    attempt: i64,
    retries_attempted: i64,
    document: String,
    detail: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<TaskInstance> {
        let mut task: TaskInstance = serde_json::from_str(&self.document)?;
        task.state = self
            .state
            .parse::<TaskState>()
            .map_err(|e| corrupt("task state", e))?;
        task.attempt = self.attempt as u32;
        task.retries_attempted = self.retries_attempted as u32;
        task.detail = self.detail.as_deref().map(serde_json::from_str).transpose()?;
        task.started_at = self.started_at;
        task.finished_at = self.finished_at;
        Ok(task)
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    task_id: String,
    scheduler_id: String,
    acquired_at_ms: i64,
    expires_at_ms: i64,
}

impl TryFrom<LeaseRow> for Lease {
    type Error = Error;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(Lease {
            task_id: row.task_id,
            scheduler_id: row.scheduler_id,
            acquired_at: from_millis(row.acquired_at_ms)?,
            expires_at: from_millis(row.expires_at_ms)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CompletedRow {
    id: i64,
    task_id: String,
    graph_id: String,
    domain: String,
    state: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CompletedRow> for CompletedTaskRecord {
    type Error = Error;

    fn try_from(row: CompletedRow) -> Result<Self> {
        Ok(CompletedTaskRecord {
            id: row.id,
            task_id: row.task_id,
            graph_id: row.graph_id,
            domain: row.domain,
            state: row
                .state
                .parse()
                .map_err(|e| corrupt("completed task state", e))?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    action: String,
    routing_key: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for TaskEventRecord {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(TaskEventRecord {
            id: row.id,
            action: row.action.parse().map_err(|e| corrupt("event action", e))?,
            routing_key: row.routing_key,
            payload: serde_json::from_str(&row.payload)?,
            created_at: row.created_at,
        })
    }
}

/// Store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are expected to have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and apply migrations.
    ///
    /// In-memory URLs get a single connection so every query sees the same
    /// database.
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_graph(&self, instance_id: &str, row: GraphRow) -> Result<GraphInstance> {
        let mut graph: GraphInstance = serde_json::from_str(&row.document)?;
        graph.status = row
            .status
            .parse::<GraphStatus>()
            .map_err(|e| corrupt("graph status", e))?;
        graph.completed_at = row.completed_at;

        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT state, attempt, retries_attempted, document, detail, started_at, finished_at
            FROM tasks
            WHERE graph_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        graph.tasks.clear();
        for row in rows {
            let task = row.into_task()?;
            graph.tasks.insert(task.label.clone(), task);
        }
        Ok(graph)
    }

    async fn active_instance_for_target(&self, target: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(&format!(
            "SELECT instance_id FROM graphs WHERE target = ? AND status IN {} LIMIT 1",
            LIVE_GRAPH_STATUSES
        ))
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn load_graphs(&self, ids: Vec<String>) -> Result<Vec<GraphInstance>> {
        let mut graphs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(graph) = self.get_graph(&id).await? {
                graphs.push(graph);
            }
        }
        Ok(graphs)
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn put_task_definition(&self, definition: &TaskDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_definitions (injectable_name, definition, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(injectable_name) DO UPDATE SET
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&definition.injectable_name)
        .bind(serde_json::to_string(definition)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_definitions(&self) -> Result<Vec<TaskDefinition>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT definition FROM task_definitions ORDER BY injectable_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(Error::from))
            .collect()
    }

    async fn delete_task_definition(&self, injectable_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_definitions WHERE injectable_name = ?")
            .bind(injectable_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_graph_definition(&self, definition: &GraphDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_definitions (injectable_name, definition, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(injectable_name) DO UPDATE SET
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&definition.injectable_name)
        .bind(serde_json::to_string(definition)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_graph_definitions(&self) -> Result<Vec<GraphDefinition>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT definition FROM graph_definitions ORDER BY injectable_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(Error::from))
            .collect()
    }

    async fn delete_graph_definition(&self, injectable_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM graph_definitions WHERE injectable_name = ?")
            .bind(injectable_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_graph(&self, graph: &GraphInstance) -> Result<()> {
        let mut document = graph.clone();
        document.tasks.clear();

        if let Some(target) = &graph.target
            && let Some(instance_id) = self.active_instance_for_target(target).await?
        {
            return Err(Error::DuplicateActiveGraph {
                target: target.clone(),
                instance_id,
            });
        }

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO graphs (instance_id, injectable_name, target, domain, status,
                                service_graph, document, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&graph.instance_id)
        .bind(&graph.injectable_name)
        .bind(&graph.target)
        .bind(&graph.domain)
        .bind(graph.status.as_str())
        .bind(graph.service_graph)
        .bind(serde_json::to_string(&document)?)
        .bind(graph.created_at)
        .bind(graph.completed_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            tx.rollback().await?;
            // idx_graphs_live_target catches a writer that got in after the check
            let unique = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
            if unique
                && let Some(target) = &graph.target
                && let Some(instance_id) = self.active_instance_for_target(target).await?
            {
                return Err(Error::DuplicateActiveGraph {
                    target: target.clone(),
                    instance_id,
                });
            }
            return Err(e.into());
        }

        for task in graph.tasks.values() {
            let detail = task.detail.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, graph_id, label, domain, state, attempt,
                                   retries_attempted, document, detail, started_at, finished_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.task_id)
            .bind(&graph.instance_id)
            .bind(&task.label)
            .bind(&task.domain)
            .bind(task.state.as_str())
            .bind(task.attempt as i64)
            .bind(task.retries_attempted as i64)
            .bind(serde_json::to_string(task)?)
            .bind(detail)
            .bind(task.started_at)
            .bind(task.finished_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_graph(&self, instance_id: &str) -> Result<Option<GraphInstance>> {
        let row = sqlx::query_as::<_, GraphRow>(
            "SELECT status, document, completed_at FROM graphs WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_graph(instance_id, row).await?)),
            None => Ok(None),
        }
    }

    async fn get_graph_status(&self, instance_id: &str) -> Result<Option<GraphStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM graphs WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        status
            .map(|status| {
                status
                    .parse::<GraphStatus>()
                    .map_err(|e| corrupt("graph status", e))
            })
            .transpose()
    }

    async fn find_active_graph_for_target(&self, target: &str) -> Result<Option<GraphInstance>> {
        match self.active_instance_for_target(target).await? {
            Some(instance_id) => self.get_graph(&instance_id).await,
            None => Ok(None),
        }
    }

    async fn find_active_graphs(&self) -> Result<Vec<GraphInstance>> {
        let ids: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT instance_id FROM graphs WHERE status IN {} ORDER BY created_at",
            LIVE_GRAPH_STATUSES
        ))
        .fetch_all(&self.pool)
        .await?;
        self.load_graphs(ids).await
    }

    async fn find_running_graphs(&self, domain: &str) -> Result<Vec<GraphInstance>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT instance_id FROM graphs
            WHERE domain = ? AND status = 'running'
            ORDER BY created_at
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;
        self.load_graphs(ids).await
    }

    async fn find_service_graphs(&self) -> Result<Vec<GraphInstance>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT instance_id FROM graphs WHERE service_graph = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        self.load_graphs(ids).await
    }

    async fn set_graph_done(
        &self,
        instance_id: &str,
        status: GraphStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE graphs
            SET status = ?, completed_at = ?
            WHERE instance_id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_graph(&self, instance_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM leases WHERE task_id IN (SELECT task_id FROM tasks WHERE graph_id = ?)",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM completed_tasks WHERE graph_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE graph_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM graphs WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskInstance>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT state, attempt, retries_attempted, document, detail, started_at, finished_at
            FROM tasks
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn transition_task(
        &self,
        task_id: &str,
        attempt: u32,
        from: &[TaskState],
        to: TaskState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?
            WHERE task_id = ?
              AND attempt = ?
              AND state IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(to.as_str())
        .bind(task_id)
        .bind(attempt as i64)
        .bind(serde_json::to_string(from)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_dispatched(
        &self,
        task_id: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'dispatched', started_at = ?
            WHERE task_id = ? AND attempt = ? AND state = 'leased'
            "#,
        )
        .bind(started_at)
        .bind(task_id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reoffer_task(&self, task_id: &str, attempt: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'ready', attempt = attempt + 1, started_at = NULL
            WHERE task_id = ? AND attempt = ? AND state IN ('leased', 'dispatched')
            "#,
        )
        .bind(task_id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn retry_task(&self, task_id: &str, attempt: u32) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET state = 'pending',
                attempt = attempt + 1,
                retries_attempted = retries_attempted + 1,
                started_at = NULL
            WHERE task_id = ? AND attempt = ? AND state NOT IN {}
            "#,
            TERMINAL_STATES
        ))
        .bind(task_id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_task(&self, finished: &FinishedTask) -> Result<bool> {
        let detail = finished
            .detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET state = ?,
                detail = ?,
                started_at = COALESCE(?, started_at),
                finished_at = ?
            WHERE task_id = ? AND attempt = ? AND state NOT IN {}
            "#,
            TERMINAL_STATES
        ))
        .bind(finished.state.as_str())
        .bind(detail)
        .bind(finished.started_at)
        .bind(finished.finished_at)
        .bind(&finished.task_id)
        .bind(finished.attempt as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO completed_tasks (task_id, graph_id, domain, state, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&finished.task_id)
        .bind(&finished.graph_id)
        .bind(&finished.domain)
        .bind(finished.state.as_str())
        .bind(finished.finished_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_completed_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<CompletedTaskRecord>> {
        let rows = sqlx::query_as::<_, CompletedRow>(
            r#"
            SELECT id, task_id, graph_id, domain, state, created_at
            FROM completed_tasks
            WHERE domain = ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(domain)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CompletedTaskRecord::try_from).collect()
    }

    async fn delete_completed_tasks(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result =
            sqlx::query("DELETE FROM completed_tasks WHERE id IN (SELECT value FROM json_each(?))")
                .bind(serde_json::to_string(ids)?)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn acquire_lease(&self, lease: &Lease) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (task_id, scheduler_id, acquired_at_ms, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(task_id) DO UPDATE SET
                scheduler_id = excluded.scheduler_id,
                acquired_at_ms = excluded.acquired_at_ms,
                expires_at_ms = excluded.expires_at_ms
            WHERE leases.expires_at_ms <= ?3
            "#,
        )
        .bind(&lease.task_id)
        .bind(&lease.scheduler_id)
        .bind(lease.acquired_at.timestamp_millis())
        .bind(lease.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(
        &self,
        task_id: &str,
        scheduler_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at_ms = ? WHERE task_id = ? AND scheduler_id = ?",
        )
        .bind(expires_at.timestamp_millis())
        .bind(task_id)
        .bind(scheduler_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_lease(&self, task_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT task_id, scheduler_id, acquired_at_ms, expires_at_ms
            FROM leases
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Lease::try_from).transpose()
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lease>> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT task_id, scheduler_id, acquired_at_ms, expires_at_ms
            FROM leases
            WHERE expires_at_ms <= ?
            ORDER BY expires_at_ms
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Lease::try_from).collect()
    }

    async fn expire_lease(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE task_id = ? AND expires_at_ms <= ?")
            .bind(task_id)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_task_event(
        &self,
        action: TaskEventAction,
        routing_key: &str,
        payload: &Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_events (action, routing_key, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(action.as_str())
        .bind(routing_key)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn latest_task_event_id(&self) -> Result<i64> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM task_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_task_events(
        &self,
        action: TaskEventAction,
        routing_key: Option<&str>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TaskEventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, action, routing_key, payload, created_at
            FROM task_events
            WHERE action = ?1
              AND (?2 IS NULL OR routing_key = ?2)
              AND id > ?3
            ORDER BY id
            LIMIT ?4
            "#,
        )
        .bind(action.as_str())
        .bind(routing_key)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskEventRecord::try_from).collect()
    }

    async fn prune_task_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        // RFC 3339 text with a fixed offset compares in time order
        let result = sqlx::query("DELETE FROM task_events WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
