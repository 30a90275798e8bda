//! AnthropicProvider -- concrete `LlmProvider` implementation for the
//! Anthropic Messages API (`/v1/messages`).
//!
//! The API key is wrapped in `secrecy::SecretString` and only exposed when
//! constructing request headers; the provider deliberately has no `Debug`
//! impl.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use studio_core::llm::provider::{EventStream, LlmProvider};
use studio_types::llm::{CompletionRequest, CompletionResponse, LlmError, Usage};

use super::streaming::create_anthropic_stream;
use super::types::{
    map_stop_reason, AnthropicContentBlock, AnthropicMessage, AnthropicNonStreamResponse,
    AnthropicRequest,
};

/// Anthropic Claude LLM provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl AnthropicProvider {
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            // Long ceiling for hour-scale agent generations; per-step
            // timeouts are enforced by the executor.
            .timeout(Duration::from_secs(3900))
            .build()
            .unwrap_or_default();

        Self { client, api_key, base_url: "https://api.anthropic.com".to_string() }
    }

    /// Override the base URL (proxies, tests).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn to_anthropic_request(request: &CompletionRequest, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage { role: m.role.to_string(), content: m.content.clone() })
                .collect(),
            system: request.system.clone(),
            stream,
            temperature: request.temperature,
        }
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::to_anthropic_request(request, false);

        let response = self
            .client
            .post(self.url("/v1/messages"))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider { message: format!("HTTP request failed: {e}") })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 => LlmError::AuthenticationFailed,
                429 => LlmError::RateLimited { retry_after_ms: None },
                529 => LlmError::Overloaded(error_body),
                400 => LlmError::InvalidRequest(error_body),
                _ => LlmError::Provider { message: format!("HTTP {status}: {error_body}") },
            });
        }

        let parsed: AnthropicNonStreamResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            id: parsed.id,
            content,
            model: parsed.model,
            stop_reason: map_stop_reason(parsed.stop_reason.as_deref()),
            usage: Usage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }

    fn stream(&self, request: CompletionRequest) -> EventStream {
        let body = Self::to_anthropic_request(&request, true);
        create_anthropic_stream(&self.client, &self.url("/v1/messages"), body, &self.api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_types::llm::Message;

    fn make_provider() -> AnthropicProvider {
        AnthropicProvider::new(SecretString::from("test-key-not-real"))
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: vec![Message::user("Hello")],
            system: Some("Be helpful".to_string()),
            max_tokens: 1024,
            temperature: Some(0.7),
            stream: false,
        }
    }

    #[test]
    fn provider_name() {
        assert_eq!(make_provider().name(), "anthropic");
    }

    #[test]
    fn request_conversion_sets_stream_flag() {
        let converted = AnthropicProvider::to_anthropic_request(&request(), true);
        assert_eq!(converted.model, "claude-sonnet-4-20250514");
        assert!(converted.stream);
        assert_eq!(converted.messages.len(), 1);
        assert_eq!(converted.messages[0].role, "user");
        assert_eq!(converted.system.as_deref(), Some("Be helpful"));
        assert_eq!(converted.temperature, Some(0.7));
    }

    #[test]
    fn base_url_override() {
        let provider = make_provider().with_base_url("http://localhost:8080".to_string());
        assert_eq!(provider.url("/v1/messages"), "http://localhost:8080/v1/messages");
    }
}
