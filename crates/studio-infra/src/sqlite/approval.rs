//! SQLite approval store.
//!
//! Implements `ApprovalStore` over the relational `workflow_approvals` table.
//! Columns mirror the `Approval` fields; listings support project, status,
//! risk, and prompt-substring filters with pagination.

use chrono::{DateTime, Utc};
use sqlx::Row;
use studio_core::repository::approval::ApprovalStore;
use studio_types::approval::{Approval, ApprovalFilter, ApprovalPage, ApprovalStatus, RiskLevel};
use studio_types::error::RepositoryError;
use studio_types::workflow::TimeoutBehavior;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ApprovalStore`.
pub struct SqliteApprovalStore {
    pool: DatabasePool,
}

impl SqliteApprovalStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_value(value)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(String::from)
        .ok_or_else(|| RepositoryError::Query("enum did not serialize to string".to_string()))
}

fn enum_parse<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn approval_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Approval, RepositoryError> {
    let read = |col: &str| -> Result<String, RepositoryError> {
        row.try_get::<String, _>(col)
            .map_err(|e| RepositoryError::Query(e.to_string()))
    };
    let read_opt = |col: &str| -> Result<Option<String>, RepositoryError> {
        row.try_get::<Option<String>, _>(col)
            .map_err(|e| RepositoryError::Query(e.to_string()))
    };

    let status: ApprovalStatus = enum_parse(&read("status")?)?;
    let risk_level: RiskLevel = enum_parse(&read("risk_level")?)?;
    let timeout_behavior: TimeoutBehavior = enum_parse(&read("timeout_behavior")?)?;

    let context_data = read_opt("context_data")?
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| RepositoryError::Query(format!("invalid context_data: {e}")))
        })
        .transpose()?;

    Ok(Approval {
        id: parse_uuid(&read("id")?)?,
        thread_id: read("thread_id")?,
        step_id: read("step_id")?,
        project_id: read_opt("project_id")?,
        prompt: read("prompt")?,
        risk_level,
        status,
        timeout_behavior,
        requested_at: parse_datetime(&read("requested_at")?)?,
        expires_at: read_opt("expires_at")?.as_deref().map(parse_datetime).transpose()?,
        resolved_by: read_opt("resolved_by")?,
        resolved_at: read_opt("resolved_at")?.as_deref().map(parse_datetime).transpose()?,
        decision_comment: read_opt("decision_comment")?,
        assigned_to: read_opt("assigned_to")?,
        context_data,
    })
}

// ---------------------------------------------------------------------------
// ApprovalStore impl
// ---------------------------------------------------------------------------

impl ApprovalStore for SqliteApprovalStore {
    async fn insert(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let context_data = approval
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_approvals
               (id, thread_id, step_id, project_id, prompt, risk_level, status,
                timeout_behavior, requested_at, expires_at, resolved_by, resolved_at,
                decision_comment, assigned_to, context_data)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(approval.id.to_string())
        .bind(&approval.thread_id)
        .bind(&approval.step_id)
        .bind(&approval.project_id)
        .bind(&approval.prompt)
        .bind(enum_str(&approval.risk_level)?)
        .bind(enum_str(&approval.status)?)
        .bind(enum_str(&approval.timeout_behavior)?)
        .bind(format_datetime(&approval.requested_at))
        .bind(approval.expires_at.as_ref().map(format_datetime))
        .bind(&approval.resolved_by)
        .bind(approval.resolved_at.as_ref().map(format_datetime))
        .bind(&approval.decision_comment)
        .bind(&approval.assigned_to)
        .bind(&context_data)
        .execute(&self.pool.writer)
        .await;

        result.map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("approval {} already exists", approval.id))
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        Ok(())
    }

    async fn update(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let context_data = approval
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE workflow_approvals SET
                 status = ?, expires_at = ?, resolved_by = ?, resolved_at = ?,
                 decision_comment = ?, assigned_to = ?, context_data = ?
               WHERE id = ?"#,
        )
        .bind(enum_str(&approval.status)?)
        .bind(approval.expires_at.as_ref().map(format_datetime))
        .bind(&approval.resolved_by)
        .bind(approval.resolved_at.as_ref().map(format_datetime))
        .bind(&approval.decision_comment)
        .bind(&approval.assigned_to)
        .bind(&context_data)
        .bind(approval.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_approvals WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(approval_from_row).transpose()
    }

    async fn find_for_step(
        &self,
        thread_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM workflow_approvals
               WHERE thread_id = ? AND step_id = ?
               ORDER BY requested_at DESC LIMIT 1"#,
        )
        .bind(thread_id)
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(approval_from_row).transpose()
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        page: u32,
        page_size: u32,
    ) -> Result<ApprovalPage, RepositoryError> {
        // Status list is variable-length; build the IN clause by hand.
        let status_strs: Vec<String> = filter
            .status
            .iter()
            .map(enum_str)
            .collect::<Result<_, _>>()?;
        let status_clause = if status_strs.is_empty() {
            "1=1".to_string()
        } else {
            let placeholders = vec!["?"; status_strs.len()].join(", ");
            format!("status IN ({placeholders})")
        };

        let risk = filter.risk_level.as_ref().map(enum_str).transpose()?;
        let search = filter.search.as_ref().map(|s| format!("%{}%", s.to_lowercase()));

        let base = format!(
            r#"FROM workflow_approvals
               WHERE (? IS NULL OR project_id = ?)
                 AND {status_clause}
                 AND (? IS NULL OR risk_level = ?)
                 AND (? IS NULL OR LOWER(prompt) LIKE ?)"#
        );

        let count_sql = format!("SELECT COUNT(*) AS n {base}");
        let mut count_query = sqlx::query(&count_sql)
            .bind(&filter.project_id)
            .bind(&filter.project_id);
        for status in &status_strs {
            count_query = count_query.bind(status);
        }
        count_query = count_query.bind(&risk).bind(&risk).bind(&search).bind(&search);
        let total: i64 = count_query
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .try_get("n")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let offset = (page.saturating_sub(1) as i64) * page_size as i64;
        let list_sql =
            format!("SELECT * {base} ORDER BY requested_at DESC LIMIT ? OFFSET ?");
        let mut list_query = sqlx::query(&list_sql)
            .bind(&filter.project_id)
            .bind(&filter.project_id);
        for status in &status_strs {
            list_query = list_query.bind(status);
        }
        list_query = list_query
            .bind(&risk)
            .bind(&risk)
            .bind(&search)
            .bind(&search)
            .bind(page_size as i64)
            .bind(offset);

        let rows = list_query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let items: Vec<Approval> = rows
            .iter()
            .map(approval_from_row)
            .collect::<Result<_, _>>()?;

        Ok(ApprovalPage { items, total: total as u64, page, page_size })
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_approvals
               WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
               ORDER BY expires_at ASC"#,
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(approval_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
