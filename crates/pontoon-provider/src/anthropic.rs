//! Anthropic messages back-end with secure API key handling.
//!
//! Unary calls go through `POST /v1/messages`; streaming calls set
//! `stream: true` and decode the `message_start` / `content_block_delta` /
//! `message_delta` event sequence into normalized [`StreamEvent`]s.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::sse::{SseDecoder, SseFrame};
use crate::{
    ContentBlock, DirectProvider, EventStream, LlmResponse, ProviderError, SamplingRequest,
    StreamEvent, TokenUsage,
};

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: Secret<String>,
    base_url: Url,
}

impl AnthropicProvider {
    /// Create a provider against the public API endpoint.
    ///
    /// The key must carry the `sk-ant-` vendor prefix; it is stored behind
    /// [`Secret`] and zeroized on drop.
    pub fn new(api_key: Secret<String>, timeout: Duration) -> Result<Self, ProviderError> {
        if !api_key.expose_secret().starts_with("sk-ant-") {
            return Err(ProviderError::Unavailable(
                "invalid Anthropic API key format".into(),
            ));
        }

        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|e| ProviderError::Unavailable(format!("invalid base URL: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pontoon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        debug!("initialized Anthropic provider");

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
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.expose_secret())
                .map_err(|_| ProviderError::Unavailable("API key is not header-safe".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn post_messages(
        &self,
        request: &SamplingRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let (system, turns) = request.project_system();
        let wire = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            messages: turns
                .into_iter()
                .map(|m| WireMessage {
                    role: match m.role {
                        crate::ChatRole::Assistant => "assistant",
                        _ => "user",
                    },
                    content: m.content,
                })
                .collect(),
            system,
            stream: stream.then_some(true),
        };

        let url = self
            .base_url
            .join("/v1/messages")
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
impl DirectProvider for AnthropicProvider {
    async fn generate_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<LlmResponse, ProviderError> {
        debug!(model = %request.model, "anthropic unary request");
        let response = self.post_messages(request, false).await?;

        let wire: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let content: Vec<ContentBlock> = wire
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| ContentBlock::Text { text: block.text })
            .collect();

        if content.is_empty() {
            return Err(ProviderError::Malformed("response carried no text".into()));
        }

        Ok(LlmResponse {
            content,
            stop_reason: wire.stop_reason,
            model: wire.model,
            usage: Some(TokenUsage {
                input_tokens: wire.usage.input_tokens,
                output_tokens: wire.usage.output_tokens,
            }),
        })
    }

    async fn stream_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<EventStream, ProviderError> {
        debug!(model = %request.model, "anthropic streaming request");
        let response = self.post_messages(request, true).await?;

        let state = StreamState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            input_tokens: 0,
        };

        Ok(futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, Some(state)));
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
        "anthropic"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamEvent, ProviderError>>,
    input_tokens: u32,
}

fn handle_frame(state: &mut StreamState, frame: SseFrame) {
    let Ok(payload) = serde_json::from_str::<StreamPayload>(&frame.data) else {
        // Pings and unknown event shapes are skipped.
        return;
    };

    match payload {
        StreamPayload::MessageStart { message } => {
            if let Some(usage) = message.usage {
                state.input_tokens = usage.input_tokens;
            }
        }
        StreamPayload::ContentBlockDelta { delta } => {
            if delta.kind == "text_delta" && !delta.text.is_empty() {
                state.pending.push_back(Ok(StreamEvent::Chunk(delta.text)));
            }
        }
        StreamPayload::MessageDelta { usage } => {
            if let Some(usage) = usage {
                state.pending.push_back(Ok(StreamEvent::Usage(TokenUsage {
                    input_tokens: state.input_tokens,
                    output_tokens: usage.output_tokens,
                })));
            }
        }
        StreamPayload::MessageStop | StreamPayload::Other => {}
    }
}

// Wire types.

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<WireContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    model: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamPayload {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<StartUsage>,
}

#[derive(Debug, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}
