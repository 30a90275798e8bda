//! SQLite workflow state store.
//!
//! Implements `WorkflowStateStore` from `studio-core`. The full thread state
//! is stored as one JSON document per `thread_id`; `project_id`, `status`,
//! and `updated_at` are mirrored into columns for listing queries. `save` is
//! an upsert inside a single statement, which SQLite executes atomically --
//! the durable image is always a complete pre- or post-save state.

use chrono::{DateTime, Utc};
use sqlx::Row;
use studio_core::repository::workflow::{ThreadFilter, WorkflowStateStore};
use studio_types::error::RepositoryError;
use studio_types::workflow::{ThreadStatus, ThreadSummary, WorkflowState};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStateStore`.
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status_str(status: ThreadStatus) -> Result<String, RepositoryError> {
    serde_json::to_value(status)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(String::from)
        .ok_or_else(|| RepositoryError::Query("status did not serialize to string".to_string()))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// WorkflowStateStore impl
// ---------------------------------------------------------------------------

impl WorkflowStateStore for SqliteStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;
        let status = status_str(state.status)?;

        sqlx::query(
            r#"INSERT INTO workflow_threads (thread_id, project_id, status, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(thread_id) DO UPDATE SET
                 project_id = excluded.project_id,
                 status = excluded.status,
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.thread_id)
        .bind(&state.project_id)
        .bind(&status)
        .bind(&state_json)
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM workflow_threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let state: String = row
                    .try_get("state")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let state: WorkflowState = serde_json::from_str(&state)
                    .map_err(|e| RepositoryError::Query(format!("invalid state JSON: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &ThreadFilter) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let status = filter.status.map(status_str).transpose()?;

        let rows = sqlx::query(
            r#"SELECT state FROM workflow_threads
               WHERE (? IS NULL OR project_id = ?)
                 AND (? IS NULL OR status = ?)
               ORDER BY updated_at DESC"#,
        )
        .bind(&filter.project_id)
        .bind(&filter.project_id)
        .bind(&status)
        .bind(&status)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let state: WorkflowState = serde_json::from_str(&state)
                .map_err(|e| RepositoryError::Query(format!("invalid state JSON: {e}")))?;
            summaries.push(ThreadSummary {
                thread_id: state.thread_id.clone(),
                status: state.status,
                project_id: state.project_id.clone(),
                started_at: state.created_at,
                last_update: state.updated_at,
                step_statuses: state.step_status,
            });
        }
        Ok(summaries)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_threads WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
