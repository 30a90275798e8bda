//! Context-aware operator: classifies an agent's free-text response as
//! success, blocked, or failed.
//!
//! The verdict is never derived from hard-coded keyword lists against the
//! agent's response. Classification runs through a pluggable LLM call whose
//! prompt comes from `OperatorPolicy`; the regex only parses the *operator's*
//! one-word reply. On operator-call failure the verdict falls back to
//! `success` when the response is non-empty and `failed` otherwise, with a
//! warning logged.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use studio_types::config::OperatorPolicy;
use studio_types::llm::{CompletionRequest, Message};
use studio_types::workflow::{Verdict, VerdictKind};

use crate::llm::provider::BoxLlmProvider;

/// Input to a verdict classification.
#[derive(Debug, Clone)]
pub struct OperatorInput<'a> {
    pub response: &'a str,
    pub role: &'a str,
    pub task: &'a str,
}

/// Port for response classification. One method; implementations must be
/// deterministic for identical inputs.
pub trait ResponseOperator: Send + Sync {
    fn classify<'a>(&'a self, input: OperatorInput<'a>) -> BoxFuture<'a, Verdict>;
}

// ---------------------------------------------------------------------------
// LlmOperator
// ---------------------------------------------------------------------------

/// LLM-backed operator.
pub struct LlmOperator {
    provider: Arc<BoxLlmProvider>,
    policy: OperatorPolicy,
    verdict_re: Option<regex::Regex>,
}

impl LlmOperator {
    pub fn new(provider: Arc<BoxLlmProvider>, policy: OperatorPolicy) -> Self {
        // An invalid configured regex falls back to the default pattern; if
        // that also fails to compile, every reply takes the fallback path.
        let verdict_re = regex::Regex::new(&policy.verdict_parse_regex)
            .or_else(|e| {
                tracing::warn!(
                    pattern = policy.verdict_parse_regex.as_str(),
                    error = %e,
                    "invalid verdictParseRegex, using default"
                );
                regex::Regex::new(&OperatorPolicy::default().verdict_parse_regex)
            })
            .ok();
        Self { provider, policy, verdict_re }
    }

    fn build_prompt(&self, input: &OperatorInput<'_>) -> String {
        self.policy
            .user_prompt_template
            .replace("{role}", input.role)
            .replace("{task}", input.task)
            .replace("{response}", input.response)
    }

    fn parse_verdict(&self, reply: &str) -> Option<VerdictKind> {
        let captured = self.verdict_re.as_ref()?.captures(reply)?;
        let word = captured.get(1).or_else(|| captured.get(0))?.as_str();
        match word.to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(VerdictKind::Success),
            "BLOCKED" => Some(VerdictKind::Blocked),
            "FAILED" => Some(VerdictKind::Failed),
            _ => None,
        }
    }

    /// Fallback when the operator call fails or its reply is unparseable.
    fn fallback(input: &OperatorInput<'_>, reason: &str) -> Verdict {
        let kind = if input.response.trim().is_empty() {
            VerdictKind::Failed
        } else {
            VerdictKind::Success
        };
        Verdict {
            verdict: kind,
            confidence: 0.0,
            reason: format!("operator unavailable ({reason})"),
        }
    }
}

impl ResponseOperator for LlmOperator {
    fn classify<'a>(&'a self, input: OperatorInput<'a>) -> BoxFuture<'a, Verdict> {
        Box::pin(async move {
            let request = CompletionRequest {
                model: self.policy.model.clone(),
                messages: vec![Message::user(self.build_prompt(&input))],
                system: Some(self.policy.system_prompt.clone()),
                max_tokens: self.policy.max_tokens,
                // Deterministic for identical inputs.
                temperature: Some(0.0),
                stream: false,
            };

            let reply = match self.provider.complete(&request).await {
                Ok(response) => response.content,
                Err(e) => {
                    tracing::warn!(error = %e, "operator call failed, applying fallback verdict");
                    return Self::fallback(&input, &e.to_string());
                }
            };

            match self.parse_verdict(&reply) {
                Some(kind) => {
                    let reason = reply
                        .lines()
                        .skip(1)
                        .collect::<Vec<_>>()
                        .join(" ")
                        .trim()
                        .to_string();
                    Verdict { verdict: kind, confidence: 0.9, reason }
                }
                None => {
                    tracing::warn!(reply = reply.as_str(), "unparseable operator reply");
                    Self::fallback(&input, "unparseable reply")
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// StaticOperator (tests and operator-less deployments)
// ---------------------------------------------------------------------------

/// Operator that returns a fixed verdict kind; confidence 1.0.
pub struct StaticOperator(pub VerdictKind);

impl ResponseOperator for StaticOperator {
    fn classify<'a>(&'a self, _input: OperatorInput<'a>) -> BoxFuture<'a, Verdict> {
        let kind = self.0;
        Box::pin(async move {
            Verdict { verdict: kind, confidence: 1.0, reason: "static".to_string() }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
