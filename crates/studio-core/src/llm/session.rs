//! Session layer over an LLM provider.
//!
//! The Messages API is stateless; workflow steps want conversational
//! continuity. `SessionLlm` keeps per-session message history keyed by an
//! opaque UUIDv7 handle and exposes the engine's invocation contract:
//! `invoke(systemPrompt, userPrompt, sessionId?) -> stream + sessionId'`.
//!
//! History lives in memory. A resumed thread reuses its stored session id --
//! the conversation restarts, but re-runs stay idempotent because steps are
//! keyed by `(threadId, stepId, attempt)`.

use std::sync::Arc;

use dashmap::DashMap;
use studio_types::llm::{CompletionRequest, Message, StreamEvent};
use uuid::Uuid;

use super::provider::{BoxLlmProvider, EventStream};

/// Parameters for a session-scoped agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub system_prompt: String,
    pub user_prompt: String,
    pub session_id: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// A session-scoped LLM client.
pub struct SessionLlm {
    provider: Arc<BoxLlmProvider>,
    histories: DashMap<String, Vec<Message>>,
}

impl SessionLlm {
    pub fn new(provider: Arc<BoxLlmProvider>) -> Self {
        Self { provider, histories: DashMap::new() }
    }

    pub fn provider(&self) -> &Arc<BoxLlmProvider> {
        &self.provider
    }

    /// Start (or continue) a session and stream the response.
    ///
    /// Returns the session id alongside the event stream. The caller must
    /// feed the final text back via [`SessionLlm::record_response`] so the
    /// assistant turn lands in the history.
    pub fn invoke(&self, invocation: AgentInvocation) -> (String, EventStream) {
        let session_id = invocation
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let mut messages = self
            .histories
            .get(&session_id)
            .map(|h| h.clone())
            .unwrap_or_default();
        messages.push(Message::user(invocation.user_prompt.clone()));

        // Persist the user turn immediately so a concurrent invoke on the
        // same session observes a consistent prefix.
        self.histories.insert(session_id.clone(), messages.clone());

        let request = CompletionRequest {
            model: invocation.model,
            messages,
            system: Some(invocation.system_prompt),
            max_tokens: invocation.max_tokens,
            temperature: Some(invocation.temperature),
            stream: true,
        };

        (session_id, self.provider.stream(request))
    }

    /// Record the assistant's final text under the session.
    pub fn record_response(&self, session_id: &str, text: &str) {
        if let Some(mut history) = self.histories.get_mut(session_id) {
            history.push(Message::assistant(text.to_string()));
        }
    }

    /// Drop a session's history (e.g. `startNewConversation`).
    pub fn forget(&self, session_id: &str) {
        self.histories.remove(session_id);
    }

    /// Collect a stream's text deltas into the final response text.
    pub async fn collect_text(stream: &mut EventStream) -> Result<String, studio_types::llm::LlmError> {
        use futures_util::StreamExt;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::TextDelta { text: t } = event? {
                text.push_str(&t);
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmProvider;

    fn session_llm(responses: Vec<&str>) -> SessionLlm {
        let provider = BoxLlmProvider::new(MockLlmProvider::scripted(
            responses.into_iter().map(String::from).collect(),
        ));
        SessionLlm::new(Arc::new(provider))
    }

    fn invocation(prompt: &str, session_id: Option<String>) -> AgentInvocation {
        AgentInvocation {
            system_prompt: "be brief".to_string(),
            user_prompt: prompt.to_string(),
            session_id,
            model: "mock".to_string(),
            max_tokens: 64,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn invoke_mints_session_id_when_absent() {
        let llm = session_llm(vec!["ok"]);
        let (session_id, mut stream) = llm.invoke(invocation("hi", None));
        assert!(!session_id.is_empty());
        let text = SessionLlm::collect_text(&mut stream).await.unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn history_accumulates_across_turns() {
        let llm = session_llm(vec!["first", "second"]);
        let (session_id, mut stream) = llm.invoke(invocation("q1", None));
        let text = SessionLlm::collect_text(&mut stream).await.unwrap();
        llm.record_response(&session_id, &text);

        let (same_id, mut stream) =
            llm.invoke(invocation("q2", Some(session_id.clone())));
        assert_eq!(same_id, session_id);
        let _ = SessionLlm::collect_text(&mut stream).await.unwrap();

        let history = llm.histories.get(&session_id).unwrap();
        // user q1, assistant first, user q2
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn forget_clears_history() {
        let llm = session_llm(vec!["x"]);
        let (session_id, mut stream) = llm.invoke(invocation("hi", None));
        let _ = SessionLlm::collect_text(&mut stream).await.unwrap();
        llm.forget(&session_id);
        assert!(llm.histories.get(&session_id).is_none());
    }
}
