//! Agent configuration types.
//!
//! An `AgentConfig` bundles the identity and LLM settings resolved for a task
//! step: either directly by `agentId` or through role resolution against the
//! project's agent set, falling back to the global registry.

use serde::{Deserialize, Serialize};

/// Configuration for invoking an LLM agent on behalf of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl AgentConfig {
    /// A minimal agent used by engine tests.
    pub fn for_role(role: &str) -> Self {
        Self {
            id: format!("agent-{role}"),
            name: role.to_string(),
            role: role.to_string(),
            system_prompt: format!("You are the {role} agent."),
            model: "claude-sonnet-4-20250514".to_string(),
            tools: Vec::new(),
            max_tokens: 8192,
            temperature: 0.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_serde() {
        let config = AgentConfig::for_role("dev");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"systemPrompt\""));
        assert!(json.contains("\"maxTokens\":8192"));
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.role, "dev");
    }
}
