//! Engine configuration.
//!
//! Deserialized from `config.toml` in the data directory; every field has a
//! default so a missing file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrently running steps per thread.
    pub max_concurrency: usize,
    /// Default per-step LLM timeout in seconds.
    pub step_timeout_secs: u64,
    /// Default approval timeout in seconds.
    pub approval_timeout_secs: u64,
    /// Heartbeat staleness threshold for the monitor.
    pub heartbeat_stale_secs: u64,
    /// Monitor scan interval.
    pub monitor_scan_secs: u64,
    /// Maximum auto-resume attempts per stale thread.
    pub max_resume_attempts: u32,
    /// Context-aware operator settings.
    pub operator: OperatorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            step_timeout_secs: 3600,
            approval_timeout_secs: 3600,
            heartbeat_stale_secs: 120,
            monitor_scan_secs: 30,
            max_resume_attempts: 3,
            operator: OperatorPolicy::default(),
        }
    }
}

/// Configuration for the context-aware operator that classifies agent
/// responses as success/blocked/failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorPolicy {
    pub model: String,
    pub system_prompt: String,
    /// Template with `{role}`, `{task}`, and `{response}` placeholders.
    pub user_prompt_template: String,
    /// Regex extracting the verdict word from the operator's reply.
    pub verdict_parse_regex: String,
    pub max_tokens: u32,
}

impl Default for OperatorPolicy {
    fn default() -> Self {
        Self {
            model: "claude-haiku-3-5-20250514".to_string(),
            system_prompt: "You judge whether an agent completed its task. \
                            Reply with exactly one word on the first line: \
                            SUCCESS, BLOCKED, or FAILED, then a one-sentence reason."
                .to_string(),
            user_prompt_template: "Role: {role}\nTask: {task}\n\nAgent response:\n{response}"
                .to_string(),
            verdict_parse_regex: r"(?i)\b(SUCCESS|BLOCKED|FAILED)\b".to_string(),
            max_tokens: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.step_timeout_secs, 3600);
        assert_eq!(config.approval_timeout_secs, 3600);
        assert_eq!(config.heartbeat_stale_secs, 120);
        assert_eq!(config.monitor_scan_secs, 30);
        assert_eq!(config.max_resume_attempts, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str("max_concurrency = 4").unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.step_timeout_secs, 3600);
    }

    #[test]
    fn operator_policy_placeholders_present() {
        let policy = OperatorPolicy::default();
        assert!(policy.user_prompt_template.contains("{response}"));
        assert!(policy.user_prompt_template.contains("{task}"));
        assert!(policy.verdict_parse_regex.contains("SUCCESS"));
    }
}
