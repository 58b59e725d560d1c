#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **pontoon-provider** – LLM back-ends for the sampling bridge.
//!
//! This crate defines the normalized request/response/stream-event types,
//! the [`DirectProvider`] trait with its Anthropic and OpenAI
//! implementations, a factory that resolves a provider from the
//! environment, and the MCP sampling path: a nullable capability adapter
//! over the upstream MCP client.
//!
//! API keys live in [`secrecy::Secret`] wrappers and are zeroized on drop;
//! they never appear in `Debug` output, errors, or logs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anthropic;
pub mod factory;
pub mod mcp;
pub mod openai;
mod sse;

pub use anthropic::AnthropicProvider;
pub use factory::{provider_from_env, ProviderTag};
pub use mcp::{McpSampling, McpSamplingPath};
pub use openai::OpenAiProvider;

/// Role of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
    /// System instruction turn.
    System,
}

/// One chat turn with flattened text content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: ChatRole,
    /// Turn text.
    pub content: String,
}

/// A normalized sampling request, provider-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingRequest {
    /// Conversation turns, oldest first. May include system-role turns;
    /// providers project those into their dedicated system slot.
    pub messages: Vec<ChatMessage>,
    /// System prompt, if any. Joined with projected system-role turns.
    pub system_prompt: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Completion token ceiling for this call.
    pub max_tokens: u32,
}

impl SamplingRequest {
    /// Split the request into the provider's dedicated system text and the
    /// user/assistant turns. System-role messages are appended to the
    /// explicit system prompt, separated by blank lines.
    pub fn project_system(&self) -> (Option<String>, Vec<ChatMessage>) {
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            if !prompt.is_empty() {
                system_parts.push(prompt.clone());
            }
        }

        let mut turns = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            match message.role {
                ChatRole::System => system_parts.push(message.content.clone()),
                ChatRole::User | ChatRole::Assistant => turns.push(message.clone()),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }
}

/// One block of response content. Only text blocks exist on this wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// A text block.
    Text {
        /// The text payload.
        text: String,
    },
}

impl ContentBlock {
    /// Build a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub input_tokens: u32,
    /// Tokens in the completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Combined input and output count.
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A normalized completion response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmResponse {
    /// Response content blocks, in order.
    pub content: Vec<ContentBlock>,
    /// Why generation stopped, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Model that produced the response, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Token accounting, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// Concatenated text of all content blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect()
    }
}

/// One event of a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A piece of generated text.
    Chunk(String),
    /// Token accounting, reported at most once near the end of the stream.
    Usage(TokenUsage),
}

/// A finite, single-consumer stream of completion events. Dropping the
/// stream closes the upstream connection.
pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Failures talking to a direct provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider could not be reached or refused the connection
    /// (network failure, missing or rejected credentials).
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Api {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream error text, truncated by the caller if needed.
        message: String,
    },

    /// The provider answered 2xx but the payload did not parse.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// A direct LLM back-end capable of unary and streaming completions.
#[async_trait]
pub trait DirectProvider: Send + Sync {
    /// Run one completion to the end and return it.
    async fn generate_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<LlmResponse, ProviderError>;

    /// Start a streaming completion. The returned stream yields text
    /// chunks and at most one usage event; it ends after the upstream
    /// response is exhausted.
    async fn stream_message(&self, request: &SamplingRequest)
        -> Result<EventStream, ProviderError>;

    /// Provider name for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_system_merges_prompt_and_system_turns() {
        let request = SamplingRequest {
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: "be terse".into(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: "hi".into(),
                },
                ChatMessage {
                    role: ChatRole::Assistant,
                    content: "hello".into(),
                },
            ],
            system_prompt: Some("you are a helper".into()),
            model: "m".into(),
            max_tokens: 10,
        };

        let (system, turns) = request.project_system();
        assert_eq!(system.as_deref(), Some("you are a helper\n\nbe terse"));
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.role != ChatRole::System));
    }

    #[test]
    fn project_system_returns_none_when_empty() {
        let request = SamplingRequest {
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: "hi".into(),
            }],
            system_prompt: Some(String::new()),
            model: "m".into(),
            max_tokens: 10,
        };

        let (system, turns) = request.project_system();
        assert!(system.is_none());
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn response_text_concatenates_blocks() {
        let response = LlmResponse {
            content: vec![ContentBlock::text("foo"), ContentBlock::text("bar")],
            stop_reason: None,
            model: None,
            usage: None,
        };
        assert_eq!(response.text(), "foobar");
    }

    #[test]
    fn response_serializes_camel_case() {
        let response = LlmResponse {
            content: vec![ContentBlock::text("hi")],
            stop_reason: Some("end_turn".into()),
            model: Some("m".into()),
            usage: Some(TokenUsage {
                input_tokens: 3,
                output_tokens: 2,
            }),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "hi");
        assert_eq!(value["stopReason"], "end_turn");
        assert_eq!(value["usage"]["inputTokens"], 3);
        assert_eq!(value["usage"]["outputTokens"], 2);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let response = LlmResponse {
            content: vec![ContentBlock::text("hi")],
            stop_reason: None,
            model: None,
            usage: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        let map = value.as_object().unwrap();
        assert!(!map.contains_key("stopReason"));
        assert!(!map.contains_key("model"));
        assert!(!map.contains_key("usage"));
    }

    #[test]
    fn usage_total_saturates() {
        let usage = TokenUsage {
            input_tokens: u32::MAX,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), u32::MAX);
    }
}
