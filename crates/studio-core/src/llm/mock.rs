//! Scripted mock LLM provider for engine and operator tests.
//!
//! Responses are consumed in order; when the script runs out the provider
//! echoes the last user message. Optionally fails every call with a given
//! error message to exercise fallback paths.

use std::sync::Mutex;

use studio_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, StopReason, StreamEvent, Usage,
};
use uuid::Uuid;

use super::provider::{EventStream, LlmProvider};

/// Deterministic LLM provider for tests.
pub struct MockLlmProvider {
    responses: Mutex<Vec<String>>,
    fail_with: Option<String>,
}

impl MockLlmProvider {
    /// Responds with the given strings in order, then echoes.
    pub fn scripted(responses: Vec<String>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        Self { responses: Mutex::new(reversed), fail_with: None }
    }

    /// Echoes the last user message on every call.
    pub fn echo() -> Self {
        Self::scripted(Vec::new())
    }

    /// Fails every call with a provider error.
    pub fn failing(message: &str) -> Self {
        Self { responses: Mutex::new(Vec::new()), fail_with: Some(message.to_string()) }
    }

    fn next_response(&self, request: &CompletionRequest) -> String {
        let mut script = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        script.pop().unwrap_or_else(|| {
            request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default()
        })
    }
}

impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Some(message) = &self.fail_with {
            return Err(LlmError::Provider { message: message.clone() });
        }
        let content = self.next_response(request);
        Ok(CompletionResponse {
            id: Uuid::now_v7().to_string(),
            model: request.model.clone(),
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: 1, output_tokens: content.len() as u32 },
            content,
        })
    }

    fn stream(&self, request: CompletionRequest) -> EventStream {
        if let Some(message) = &self.fail_with {
            let message = message.clone();
            return Box::pin(async_stream::try_stream! {
                yield StreamEvent::Connected;
                Err(LlmError::Provider { message })?;
            });
        }
        let content = self.next_response(&request);
        Box::pin(async_stream::try_stream! {
            yield StreamEvent::Connected;
            // Emit word-granular deltas so token fan-out paths are exercised.
            for word in content.split_inclusive(' ') {
                yield StreamEvent::TextDelta { text: word.to_string() };
            }
            yield StreamEvent::MessageDelta { stop_reason: StopReason::EndTurn };
            yield StreamEvent::Done;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use studio_types::llm::Message;

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest {
            model: "mock".to_string(),
            messages: vec![Message::user(content)],
            system: None,
            max_tokens: 64,
            temperature: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn scripted_responses_in_order_then_echo() {
        let provider = MockLlmProvider::scripted(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(provider.complete(&request("a")).await.unwrap().content, "one");
        assert_eq!(provider.complete(&request("b")).await.unwrap().content, "two");
        assert_eq!(provider.complete(&request("echo me")).await.unwrap().content, "echo me");
    }

    #[tokio::test]
    async fn stream_emits_deltas_and_done() {
        let provider = MockLlmProvider::scripted(vec!["hello world".to_string()]);
        let mut stream = provider.stream(request("x"));

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::TextDelta { text: t } => text.push_str(&t),
                StreamEvent::Done => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(text, "hello world");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn failing_provider_errors() {
        let provider = MockLlmProvider::failing("boom");
        assert!(provider.complete(&request("x")).await.is_err());

        let mut stream = provider.stream(request("x"));
        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            if event.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
