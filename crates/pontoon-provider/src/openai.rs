//! OpenAI chat-completions back-end with secure API key handling.
//!
//! Unary calls go through `POST /v1/chat/completions`; streaming calls set
//! `stream: true` with `stream_options.include_usage` so the final chunk
//! carries token counts, and end on the `[DONE]` sentinel.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::sse::{SseDecoder, SseFrame};
use crate::{
    ChatRole, ContentBlock, DirectProvider, EventStream, LlmResponse, ProviderError,
    SamplingRequest, StreamEvent, TokenUsage,
};

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI GPT provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: Secret<String>,
    base_url: Url,
}

impl OpenAiProvider {
    /// Create a provider against the public API endpoint.
    ///
    /// The key must carry the `sk-` vendor prefix; it is stored behind
    /// [`Secret`] and zeroized on drop.
    pub fn new(api_key: Secret<String>, timeout: Duration) -> Result<Self, ProviderError> {
        if !api_key.expose_secret().starts_with("sk-") {
            return Err(ProviderError::Unavailable(
                "invalid OpenAI API key format".into(),
            ));
        }

        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|e| ProviderError::Unavailable(format!("invalid base URL: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pontoon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        debug!("initialized OpenAI provider");

        Ok(Self {
            client,
            api_key,
            base_url,
        })
    }

    /// Point the provider at a different endpoint (local gateways, tests).
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ProviderError> {
        self.base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Unavailable(format!("invalid base URL: {e}")))?;
        Ok(self)
    }

    fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", self.api_key.expose_secret());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|_| ProviderError::Unavailable("API key is not header-safe".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn post_chat(
        &self,
        request: &SamplingRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let (system, turns) = request.project_system();

        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(system) = system {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(turns.into_iter().map(|m| WireMessage {
            role: match m.role {
                ChatRole::Assistant => "assistant",
                _ => "user",
            },
            content: m.content,
        }));

        let wire = ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };

        let url = self
            .base_url
            .join("/v1/chat/completions")
            .map_err(|e| ProviderError::Unavailable(format!("invalid API URL: {e}")))?;

        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(&wire)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl DirectProvider for OpenAiProvider {
    async fn generate_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<LlmResponse, ProviderError> {
        debug!(model = %request.model, "openai unary request");
        let response = self.post_chat(request, false).await?;

        let wire: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("response carried no choices".into()))?;

        if choice.message.content.is_empty() {
            return Err(ProviderError::Malformed("response carried no text".into()));
        }

        Ok(LlmResponse {
            content: vec![ContentBlock::Text {
                text: choice.message.content,
            }],
            stop_reason: choice.finish_reason,
            model: wire.model,
            usage: wire.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }

    async fn stream_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<EventStream, ProviderError> {
        debug!(model = %request.model, "openai streaming request");
        let response = self.post_chat(request, true).await?;

        let state = StreamState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, Some(state)));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        for frame in state.decoder.push(&bytes) {
                            handle_frame(&mut state, frame);
                        }
                    }
                    Some(Err(e)) => {
                        let err = ProviderError::Unavailable(e.to_string());
                        return Some((Err(err), None));
                    }
                    None => return None,
                }
            }
        })
        .boxed())
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamEvent, ProviderError>>,
    finished: bool,
}

fn handle_frame(state: &mut StreamState, frame: SseFrame) {
    if frame.data.trim() == "[DONE]" {
        state.finished = true;
        return;
    }

    let Ok(chunk) = serde_json::from_str::<ChatChunk>(&frame.data) else {
        return;
    };

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                state.pending.push_back(Ok(StreamEvent::Chunk(content)));
            }
        }
    }
    if let Some(usage) = chunk.usage {
        state.pending.push_back(Ok(StreamEvent::Usage(TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })));
    }
}

// Wire types.

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
