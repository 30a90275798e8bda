//! Agent directory port and in-memory implementation.
//!
//! Resolution rules: an explicit `agentId` is looked up case-sensitively
//! within the project's agent set; a `role` is looked up case-insensitively,
//! first in the project, then in the global registry.

use dashmap::DashMap;
use studio_types::agent::AgentConfig;
use studio_types::error::RepositoryError;

/// Port for resolving workflow step agent bindings.
pub trait AgentDirectory: Send + Sync {
    /// Case-sensitive lookup by agent id within a project (or globally when
    /// `project_id` is `None`).
    fn resolve_id(
        &self,
        agent_id: &str,
        project_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<AgentConfig>, RepositoryError>> + Send;

    /// Case-insensitive lookup by role: project scope first, then global.
    fn resolve_role(
        &self,
        role: &str,
        project_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<AgentConfig>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryAgentDirectory
// ---------------------------------------------------------------------------

/// In-memory agent directory used by tests and ephemeral deployments.
///
/// Agents registered with `project_id = None` form the global registry.
#[derive(Debug, Default)]
pub struct InMemoryAgentDirectory {
    /// Keyed by (project scope, agent id).
    agents: DashMap<(Option<String>, String), AgentConfig>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, project_id: Option<&str>, config: AgentConfig) {
        self.agents
            .insert((project_id.map(String::from), config.id.clone()), config);
    }

    fn find_role_in_scope(&self, role: &str, scope: Option<&str>) -> Option<AgentConfig> {
        let role_lower = role.to_lowercase();
        self.agents
            .iter()
            .filter(|entry| entry.key().0.as_deref() == scope)
            .find(|entry| entry.value().role.to_lowercase() == role_lower)
            .map(|entry| entry.value().clone())
    }
}

impl AgentDirectory for InMemoryAgentDirectory {
    async fn resolve_id(
        &self,
        agent_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        let key = (project_id.map(String::from), agent_id.to_string());
        if let Some(config) = self.agents.get(&key) {
            return Ok(Some(config.clone()));
        }
        // Project miss falls back to the global set, still case-sensitive.
        let global = (None, agent_id.to_string());
        Ok(self.agents.get(&global).map(|c| c.clone()))
    }

    async fn resolve_role(
        &self,
        role: &str,
        project_id: Option<&str>,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        if let Some(scope) = project_id {
            if let Some(found) = self.find_role_in_scope(role, Some(scope)) {
                return Ok(Some(found));
            }
        }
        Ok(self.find_role_in_scope(role, None))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, role: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            role: role.to_string(),
            ..AgentConfig::for_role(role)
        }
    }

    #[tokio::test]
    async fn resolve_id_is_case_sensitive() {
        let dir = InMemoryAgentDirectory::new();
        dir.register(Some("proj"), agent("Dev-1", "dev"));

        assert!(dir.resolve_id("Dev-1", Some("proj")).await.unwrap().is_some());
        assert!(dir.resolve_id("dev-1", Some("proj")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_role_is_case_insensitive() {
        let dir = InMemoryAgentDirectory::new();
        dir.register(Some("proj"), agent("a1", "Developer"));

        let found = dir.resolve_role("developer", Some("proj")).await.unwrap();
        assert_eq!(found.unwrap().id, "a1");
    }

    #[tokio::test]
    async fn resolve_role_prefers_project_over_global() {
        let dir = InMemoryAgentDirectory::new();
        dir.register(None, agent("global-dev", "dev"));
        dir.register(Some("proj"), agent("proj-dev", "dev"));

        let found = dir.resolve_role("dev", Some("proj")).await.unwrap();
        assert_eq!(found.unwrap().id, "proj-dev");

        let found = dir.resolve_role("dev", Some("other")).await.unwrap();
        assert_eq!(found.unwrap().id, "global-dev");
    }

    #[tokio::test]
    async fn unresolved_role_returns_none() {
        let dir = InMemoryAgentDirectory::new();
        assert!(dir.resolve_role("ghost", None).await.unwrap().is_none());
    }
}
