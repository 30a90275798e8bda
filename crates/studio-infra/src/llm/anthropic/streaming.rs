//! SSE stream state machine for the Anthropic Messages API.
//!
//! Event order per the streaming protocol:
//! 1. `message_start` -- initial usage
//! 2. Per block: `content_block_start` -> N x `content_block_delta` -> `content_block_stop`
//! 3. `message_delta` -- stop_reason and cumulative usage
//! 4. `message_stop` -- final event
//! 5. `ping` keepalives may appear anywhere; `error` events mid-stream
//!
//! Tool-use input arrives as partial JSON fragments via `input_json_delta`,
//! accumulated per block index and parsed at `content_block_stop`.

use std::collections::HashMap;

use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use studio_core::llm::provider::EventStream;
use studio_types::llm::{LlmError, StreamEvent, Usage};

use super::types::{
    map_stop_reason, AnthropicContentBlock, AnthropicDelta, AnthropicRequest,
    ContentBlockDeltaPayload, ContentBlockStartPayload, ContentBlockStopPayload, ErrorPayload,
    MessageDeltaPayload, MessageStartPayload,
};

/// Accumulates partial JSON fragments for a tool-use block.
struct ToolUseAccumulator {
    id: String,
    name: String,
    json_buffer: String,
}

/// Create a streaming SSE connection to the Messages API, mapping
/// Anthropic-specific events onto the provider-agnostic `StreamEvent` enum.
///
/// Unknown event types are logged and skipped for forward compatibility.
pub fn create_anthropic_stream(
    client: &reqwest::Client,
    url: &str,
    body: AnthropicRequest,
    api_key: &SecretString,
) -> EventStream {
    let client = client.clone();
    let url = url.to_string();
    let api_key = api_key.expose_secret().to_string();

    Box::pin(async_stream::try_stream! {
        let request = client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body);

        let mut es = reqwest_eventsource::EventSource::new(request)
            .map_err(|e| LlmError::Stream(format!("failed to create event source: {e}")))?;

        let mut tool_buffers: HashMap<u32, ToolUseAccumulator> = HashMap::new();

        while let Some(event) = es.next().await {
            match event {
                Ok(reqwest_eventsource::Event::Open) => {
                    yield StreamEvent::Connected;
                }
                Ok(reqwest_eventsource::Event::Message(msg)) => {
                    match msg.event.as_str() {
                        "message_start" => {
                            let payload: MessageStartPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("message_start: {e}")))?;
                            if let Some(usage) = payload.message.usage {
                                yield StreamEvent::Usage(Usage {
                                    input_tokens: usage.input_tokens,
                                    output_tokens: usage.output_tokens,
                                });
                            }
                        }

                        "content_block_start" => {
                            let payload: ContentBlockStartPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("content_block_start: {e}")))?;
                            if let AnthropicContentBlock::ToolUse { id, name, .. } = payload.content_block {
                                tool_buffers.insert(
                                    payload.index,
                                    ToolUseAccumulator { id, name, json_buffer: String::new() },
                                );
                            }
                        }

                        "content_block_delta" => {
                            let payload: ContentBlockDeltaPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("content_block_delta: {e}")))?;
                            match payload.delta {
                                AnthropicDelta::TextDelta { text } => {
                                    yield StreamEvent::TextDelta { text };
                                }
                                AnthropicDelta::InputJsonDelta { partial_json } => {
                                    if let Some(acc) = tool_buffers.get_mut(&payload.index) {
                                        acc.json_buffer.push_str(&partial_json);
                                    }
                                }
                                // Thinking content is not surfaced to workflows.
                                AnthropicDelta::ThinkingDelta { .. }
                                | AnthropicDelta::SignatureDelta { .. } => {}
                            }
                        }

                        "content_block_stop" => {
                            let payload: ContentBlockStopPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("content_block_stop: {e}")))?;
                            if let Some(acc) = tool_buffers.remove(&payload.index) {
                                let input = if acc.json_buffer.is_empty() {
                                    serde_json::Value::Object(Default::default())
                                } else {
                                    serde_json::from_str(&acc.json_buffer)
                                        .map_err(|e| LlmError::Deserialization(format!("tool input JSON: {e}")))?
                                };
                                yield StreamEvent::ToolUse { id: acc.id, name: acc.name, input };
                            }
                        }

                        "message_delta" => {
                            let payload: MessageDeltaPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("message_delta: {e}")))?;
                            yield StreamEvent::Usage(Usage {
                                input_tokens: payload.usage.input_tokens,
                                output_tokens: payload.usage.output_tokens,
                            });
                            yield StreamEvent::MessageDelta {
                                stop_reason: map_stop_reason(payload.delta.stop_reason.as_deref()),
                            };
                        }

                        "message_stop" => {
                            yield StreamEvent::Done;
                        }

                        "ping" => {}

                        "error" => {
                            let payload: ErrorPayload = serde_json::from_str(&msg.data)
                                .map_err(|e| LlmError::Deserialization(format!("error event: {e}")))?;
                            let err = match payload.error.error_type.as_str() {
                                "overloaded_error" => LlmError::Overloaded(payload.error.message),
                                "rate_limit_error" => LlmError::RateLimited { retry_after_ms: None },
                                "authentication_error" => LlmError::AuthenticationFailed,
                                _ => LlmError::Provider { message: payload.error.message },
                            };
                            Err(err)?;
                        }

                        unknown => {
                            tracing::warn!(event_type = unknown, "unknown Anthropic SSE event, skipping");
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    break;
                }
                Err(e) => {
                    Err(LlmError::Stream(e.to_string()))?;
                }
            }
        }
    })
}
