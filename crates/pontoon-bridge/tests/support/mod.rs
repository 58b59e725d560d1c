//! Shared doubles and helpers for the bridge integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pontoon_bridge::{BridgeConfig, SamplingBridge};
use pontoon_provider::{
    ContentBlock, DirectProvider, EventStream, LlmResponse, McpSampling, ProviderError,
    ProviderTag, SamplingRequest, StreamEvent, TokenUsage,
};

/// Scripted direct provider.
pub struct MockProvider {
    text: String,
    usage: Option<TokenUsage>,
    chunks: Vec<String>,
    stream_usage: Option<TokenUsage>,
    chunk_delay: Duration,
    fail_unary: bool,
    error_mid_stream: bool,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<SamplingRequest>>,
}

impl MockProvider {
    fn base() -> Self {
        Self {
            text: String::new(),
            usage: None,
            chunks: Vec::new(),
            stream_usage: None,
            chunk_delay: Duration::ZERO,
            fail_unary: false,
            error_mid_stream: false,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Unary responses with the given text and usage.
    pub fn replying(text: &str, input: u32, output: u32) -> Self {
        Self {
            text: text.into(),
            usage: Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
            }),
            ..Self::base()
        }
    }

    /// Unary responses that report no usage.
    pub fn without_usage(text: &str) -> Self {
        Self {
            text: text.into(),
            ..Self::base()
        }
    }

    /// Unary calls fail with an upstream 500.
    pub fn failing() -> Self {
        Self {
            fail_unary: true,
            ..Self::base()
        }
    }

    /// Streaming responses: the given chunks, then a usage event.
    pub fn streaming(chunks: &[&str], input: u32, output: u32) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            stream_usage: Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
            }),
            ..Self::base()
        }
    }

    /// Streaming responses that fail after the given chunks.
    pub fn streaming_error_after(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            error_mid_stream: true,
            ..Self::base()
        }
    }

    /// Delay before each streamed event.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl DirectProvider for MockProvider {
    async fn generate_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<LlmResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        if self.fail_unary {
            return Err(ProviderError::Api {
                status: 500,
                message: "mock upstream exploded".into(),
            });
        }

        Ok(LlmResponse {
            content: vec![ContentBlock::text(self.text.clone())],
            stop_reason: Some("end_turn".into()),
            model: Some(request.model.clone()),
            usage: self.usage,
        })
    }

    async fn stream_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        let mut events: Vec<Result<StreamEvent, ProviderError>> = self
            .chunks
            .iter()
            .map(|chunk| Ok(StreamEvent::Chunk(chunk.clone())))
            .collect();
        if self.error_mid_stream {
            events.push(Err(ProviderError::Unavailable("mock stream broke".into())));
        } else if let Some(usage) = self.stream_usage {
            events.push(Ok(StreamEvent::Usage(usage)));
        }

        let delay = self.chunk_delay;
        Ok(futures::stream::iter(events)
            .then(move |event| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                event
            })
            .boxed())
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "m-small"
    }
}

/// Scripted upstream MCP client.
pub struct MockMcp {
    supported: bool,
    fail: bool,
    text: String,
    pub calls: AtomicUsize,
}

impl MockMcp {
    /// A client that advertises sampling and succeeds.
    pub fn replying(text: &str) -> Self {
        Self {
            supported: true,
            fail: false,
            text: text.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// A client that advertises sampling but fails every call.
    pub fn failing() -> Self {
        Self {
            supported: true,
            fail: true,
            text: String::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl McpSampling for MockMcp {
    fn supports_sampling(&self) -> bool {
        self.supported
    }

    async fn create_message(&self, request: &SamplingRequest) -> anyhow::Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("mcp client went away");
        }
        Ok(LlmResponse {
            content: vec![ContentBlock::text(self.text.clone())],
            stop_reason: None,
            model: Some(request.model.clone()),
            usage: None,
        })
    }
}

/// Config with small quotas, one allowed model (`m-small`), the empty
/// system prompt allowed, and filtering off.
pub fn test_config(max_rounds: u32, max_tokens: u32) -> BridgeConfig {
    BridgeConfig {
        enabled: true,
        provider: ProviderTag::Anthropic,
        max_rounds_per_execution: max_rounds,
        max_tokens_per_execution: max_tokens,
        timeout_per_call_ms: 5_000,
        allowed_system_prompts: HashSet::from([String::new()]),
        allowed_models: HashSet::from(["m-small".to_string()]),
        content_filtering_enabled: false,
    }
}

/// A started bridge plus everything a test needs to talk to it.
pub struct TestBridge {
    pub bridge: Arc<SamplingBridge>,
    pub port: u16,
    pub token: String,
    pub client: reqwest::Client,
}

static TRACING: Once = Once::new();

/// Install an env-filtered subscriber once per test binary, so `RUST_LOG`
/// surfaces bridge tracing when a test needs debugging.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn start_bridge(bridge: SamplingBridge) -> TestBridge {
    init_tracing();
    let bridge = Arc::new(bridge);
    let handle = bridge.start().await.expect("bridge starts");
    TestBridge {
        port: handle.port,
        token: handle.auth_token.expose_secret().clone(),
        bridge,
        client: reqwest::Client::new(),
    }
}

impl TestBridge {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub async fn sample(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url("/sample"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .expect("request reaches the bridge")
    }
}

/// Split an SSE body into its decoded `data:` payloads.
pub fn parse_sse(body: &str) -> Vec<serde_json::Value> {
    body.split("\n\n")
        .filter_map(|record| record.trim().strip_prefix("data: ").map(str::to_string))
        .map(|data| serde_json::from_str(&data).expect("frame payload is JSON"))
        .collect()
}

/// The default happy-path request body.
pub fn simple_body() -> serde_json::Value {
    serde_json::json!({
        "messages": [{"role": "user", "content": "hi"}],
        "model": "m-small"
    })
}
