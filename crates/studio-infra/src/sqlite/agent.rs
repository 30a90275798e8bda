//! SQLite agent directory.
//!
//! Implements `AgentDirectory` over the `agents` table. An empty
//! `project_id` column marks the global registry. Id lookups are
//! case-sensitive; role lookups are case-insensitive (project scope first,
//! then global).

use sqlx::Row;
use studio_core::agent::registry::AgentDirectory;
use studio_types::agent::AgentConfig;
use studio_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `AgentDirectory`.
pub struct SqliteAgentDirectory {
    pool: DatabasePool,
}

impl SqliteAgentDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an agent configuration.
    pub async fn upsert(
        &self,
        project_id: Option<&str>,
        config: &AgentConfig,
    ) -> Result<(), RepositoryError> {
        let tools = serde_json::to_string(&config.tools)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO agents
               (id, project_id, name, role, system_prompt, model, tools, max_tokens, temperature)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id, project_id) DO UPDATE SET
                 name = excluded.name,
                 role = excluded.role,
                 system_prompt = excluded.system_prompt,
                 model = excluded.model,
                 tools = excluded.tools,
                 max_tokens = excluded.max_tokens,
                 temperature = excluded.temperature"#,
        )
        .bind(&config.id)
        .bind(project_id.unwrap_or(""))
        .bind(&config.name)
        .bind(&config.role)
        .bind(&config.system_prompt)
        .bind(&config.model)
        .bind(&tools)
        .bind(config.max_tokens as i64)
        .bind(config.temperature)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn fetch_one(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let row = query
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| agent_from_row(&row)).transpose()
    }
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentConfig, RepositoryError> {
    let read = |col: &str| -> Result<String, RepositoryError> {
        row.try_get::<String, _>(col)
            .map_err(|e| RepositoryError::Query(e.to_string()))
    };
    let tools: Vec<String> = serde_json::from_str(&read("tools")?)
        .map_err(|e| RepositoryError::Query(format!("invalid tools JSON: {e}")))?;
    let max_tokens: i64 = row
        .try_get("max_tokens")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let temperature: f64 = row
        .try_get("temperature")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

    Ok(AgentConfig {
        id: read("id")?,
        name: read("name")?,
        role: read("role")?,
        system_prompt: read("system_prompt")?,
        model: read("model")?,
        tools,
        max_tokens: max_tokens as u32,
        temperature,
    })
}

impl AgentDirectory for SqliteAgentDirectory {
    async fn resolve_id(
        &self,
        agent_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        // TEXT '=' uses BINARY collation, so id matching stays case-sensitive.
        if let Some(project) = project_id {
            if let Some(found) = self
                .fetch_one(
                    "SELECT * FROM agents WHERE id = ? AND project_id = ?",
                    &[agent_id, project],
                )
                .await?
            {
                return Ok(Some(found));
            }
        }
        self.fetch_one(
            "SELECT * FROM agents WHERE id = ? AND project_id = ''",
            &[agent_id],
        )
        .await
    }

    async fn resolve_role(
        &self,
        role: &str,
        project_id: Option<&str>,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        if let Some(project) = project_id {
            if let Some(found) = self
                .fetch_one(
                    "SELECT * FROM agents WHERE LOWER(role) = LOWER(?) AND project_id = ? LIMIT 1",
                    &[role, project],
                )
                .await?
            {
                return Ok(Some(found));
            }
        }
        self.fetch_one(
            "SELECT * FROM agents WHERE LOWER(role) = LOWER(?) AND project_id = '' LIMIT 1",
            &[role],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
