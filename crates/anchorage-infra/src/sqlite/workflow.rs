//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `anchorage-core` using sqlx with split
//! read/write pools. The instance row and its history live in separate
//! tables; a save writes both in one transaction, appending only the events
//! the database has not seen yet.

use std::time::Duration;

use anchorage_core::store::WorkflowStore;
use anchorage_types::error::{EngineError, StoreError};
use anchorage_types::workflow::{
    EventKind, HistoryEvent, WorkflowFilter, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Read one instance's history on `conn`. Callers pass a transaction
    /// so the instance row and its history come from the same snapshot.
    async fn load_history(
        conn: &mut SqliteConnection,
        workflow_id: &str,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT sequence, call_id, kind, payload, timestamp FROM workflow_history
             WHERE workflow_id = ? ORDER BY sequence ASC",
        )
        .bind(workflow_id)
        .fetch_all(conn)
        .await
        .map_err(store_error)?;

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = HistoryRow::from_row(row).map_err(store_error)?;
            history.push(r.into_event()?);
        }
        Ok(history)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    workflow_id: String,
    run_id: String,
    workflow_name: String,
    status: String,
    input: String,
    result: Option<String>,
    error: Option<String>,
    timeout_ms: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            timeout_ms: row.try_get("timeout_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_state(self, history: Vec<HistoryEvent>) -> Result<WorkflowState, StoreError> {
        let status = WorkflowStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Serialization(format!("invalid workflow status: {}", self.status))
        })?;
        let result = self
            .result
            .as_deref()
            .map(|s| parse_json::<Value>(s, "result"))
            .transpose()?;
        let error = self
            .error
            .as_deref()
            .map(|s| parse_json::<EngineError>(s, "error"))
            .transpose()?;

        Ok(WorkflowState {
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status,
            input: parse_json(&self.input, "input")?,
            result,
            error,
            history,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            timeout: self
                .timeout_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
        })
    }
}

struct HistoryRow {
    sequence: i64,
    call_id: Option<i64>,
    kind: String,
    payload: String,
    timestamp: String,
}

impl HistoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            sequence: row.try_get("sequence")?,
            call_id: row.try_get("call_id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn into_event(self) -> Result<HistoryEvent, StoreError> {
        let kind = EventKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Serialization(format!("invalid event kind: {}", self.kind)))?;
        Ok(HistoryEvent {
            sequence: self.sequence as u64,
            call_id: self.call_id.map(|id| id as u64),
            kind,
            timestamp: parse_datetime(&self.timestamp)?,
            payload: parse_json(&self.payload, "payload")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Connection(e.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Serialization(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps sort lexically in time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Serialization(format!("invalid {column} JSON: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T, column: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Serialization(format!("serialize {column}: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        if state.workflow_id.is_empty() {
            return Err(StoreError::InvalidState("workflow_id is required".to_string()));
        }
        let input = to_json(&state.input, "input")?;
        let result = state
            .result
            .as_ref()
            .map(|v| to_json(v, "result"))
            .transpose()?;
        let error = state
            .error
            .as_ref()
            .map(|e| to_json(e, "error"))
            .transpose()?;
        let run_id = state.run_id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(store_error)?;

        let stored_run: Option<(String,)> =
            sqlx::query_as("SELECT run_id FROM workflow_instances WHERE workflow_id = ?")
                .bind(&state.workflow_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_error)?;

        // A new run replaces the previous run's history wholesale.
        let mut stored_len = 0u64;
        if let Some((stored_run,)) = stored_run {
            if stored_run == run_id {
                let (max,): (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(sequence), 0) FROM workflow_history WHERE workflow_id = ?",
                )
                .bind(&state.workflow_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_error)?;
                stored_len = max as u64;
            } else {
                sqlx::query("DELETE FROM workflow_history WHERE workflow_id = ?")
                    .bind(&state.workflow_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?;
            }
        }

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (workflow_id, run_id, workflow_name, status, input, result, error,
                timeout_ms, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id) DO UPDATE SET
                 run_id = excluded.run_id,
                 workflow_name = excluded.workflow_name,
                 status = excluded.status,
                 input = excluded.input,
                 result = excluded.result,
                 error = excluded.error,
                 timeout_ms = excluded.timeout_ms,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.workflow_id)
        .bind(&run_id)
        .bind(&state.workflow_name)
        .bind(state.status.as_str())
        .bind(&input)
        .bind(&result)
        .bind(&error)
        .bind(state.timeout.map(|d| d.as_millis() as i64))
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if (state.history.len() as u64) < stored_len {
            sqlx::query("DELETE FROM workflow_history WHERE workflow_id = ? AND sequence > ?")
                .bind(&state.workflow_id)
                .bind(state.history.len() as i64)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }

        let mut appended = 0usize;
        for event in state.history.iter().filter(|e| e.sequence > stored_len) {
            sqlx::query(
                r#"INSERT INTO workflow_history
                   (workflow_id, sequence, call_id, kind, payload, timestamp)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&state.workflow_id)
            .bind(event.sequence as i64)
            .bind(event.call_id.map(|id| id as i64))
            .bind(event.kind.as_str())
            .bind(to_json(&event.payload, "payload")?)
            .bind(format_datetime(&event.timestamp))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
            appended += 1;
        }

        tx.commit().await.map_err(store_error)?;
        tracing::debug!(
            workflow_id = %state.workflow_id,
            status = %state.status,
            appended,
            "workflow state saved"
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let mut tx = self.pool.reader.begin().await.map_err(store_error)?;
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;

        let state = match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(store_error)?;
                let history = Self::load_history(&mut *tx, workflow_id).await?;
                Some(r.into_state(history)?)
            }
            None => None,
        };
        tx.commit().await.map_err(store_error)?;
        Ok(state)
    }

    async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = match filter.limit {
            Some(n) if n > 0 => n as i64,
            _ => -1,
        };
        let mut tx = self.pool.reader.begin().await.map_err(store_error)?;
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, workflow_id ASC
             LIMIT ?2",
        )
        .bind(filter.status.map(WorkflowStatus::as_str))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(store_error)?;
            let history = Self::load_history(&mut *tx, &r.workflow_id).await?;
            states.push(r.into_state(history)?);
        }
        tx.commit().await.map_err(store_error)?;
        Ok(states)
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(store_error)?;
        sqlx::query("DELETE FROM workflow_history WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query("DELETE FROM workflow_instances WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
