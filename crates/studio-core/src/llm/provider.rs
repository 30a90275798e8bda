//! LlmProvider trait definition.
//!
//! The core abstraction all LLM backends implement. Uses RPITIT for
//! `complete` and `Pin<Box<dyn Stream>>` for `stream` (streams need to be
//! object-safe for the `BoxLlmProvider` wrapper).
//!
//! Implementations live in studio-infra (e.g. `AnthropicProvider`); the
//! scripted `MockLlmProvider` in this crate backs engine tests.

use std::pin::Pin;

use futures_util::Stream;

use studio_types::llm::{CompletionRequest, CompletionResponse, LlmError, StreamEvent};

/// Boxed stream of LLM events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>>;

/// Trait for LLM provider backends.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic", "mock").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;

    /// Send a streaming completion request. Returns a stream of events.
    fn stream(&self, request: CompletionRequest) -> EventStream;
}

// ---------------------------------------------------------------------------
// BoxLlmProvider
// ---------------------------------------------------------------------------

/// Object-safe wrapper so provider instances can be stored behind `Arc<dyn>`.
///
/// RPITIT traits are not dyn-compatible; this adapter erases the concrete
/// provider type behind boxed futures.
pub struct BoxLlmProvider {
    inner: Box<dyn DynLlmProvider>,
}

trait DynLlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> futures_util::future::BoxFuture<'a, Result<CompletionResponse, LlmError>>;
    fn stream_boxed(&self, request: CompletionRequest) -> EventStream;
}

impl<P: LlmProvider + 'static> DynLlmProvider for P {
    fn name(&self) -> &str {
        LlmProvider::name(self)
    }

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> futures_util::future::BoxFuture<'a, Result<CompletionResponse, LlmError>> {
        Box::pin(self.complete(request))
    }

    fn stream_boxed(&self, request: CompletionRequest) -> EventStream {
        self.stream(request)
    }
}

impl BoxLlmProvider {
    pub fn new<P: LlmProvider + 'static>(provider: P) -> Self {
        Self { inner: Box::new(provider) }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.inner.complete_boxed(request).await
    }

    pub fn stream(&self, request: CompletionRequest) -> EventStream {
        self.inner.stream_boxed(request)
    }
}

impl std::fmt::Debug for BoxLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLlmProvider").field("name", &self.inner.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmProvider;

    #[tokio::test]
    async fn box_provider_delegates() {
        let provider = BoxLlmProvider::new(MockLlmProvider::scripted(vec!["hello".to_string()]));
        assert_eq!(provider.name(), "mock");

        let request = CompletionRequest {
            model: "mock".to_string(),
            messages: vec![studio_types::llm::Message::user("hi")],
            system: None,
            max_tokens: 64,
            temperature: None,
            stream: false,
        };
        let response = provider.complete(&request).await.unwrap();
        assert_eq!(response.content, "hello");
    }
}
