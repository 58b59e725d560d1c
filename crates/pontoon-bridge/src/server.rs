//! The sampling bridge server: lifecycle, HTTP dispatch, mode selection,
//! fallback, streaming, and graceful draining.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use pontoon_filter::ContentFilter;
use pontoon_provider::{
    provider_from_env, ContentBlock, DirectProvider, LlmResponse, McpSampling, McpSamplingPath,
    SamplingRequest, StreamEvent, TokenUsage,
};
use pontoon_quota::{QuotaLedger, QuotaLimits, QuotaRemaining};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorBody};
use crate::records::{SamplingCall, SamplingMetrics};
use crate::schema::RequestValidator;
use crate::{
    DEFAULT_MAX_TOKENS, GRACEFUL_SHUTDOWN_MAX_WAIT_MS, GRACEFUL_SHUTDOWN_POLL_MS,
    MAX_SYSTEM_PROMPT_ERROR_LENGTH, MAX_TOKENS_CAP,
};

/// Connection details handed to the sandbox after [`SamplingBridge::start`].
/// The token is the only way to authenticate against the bridge.
pub struct BridgeHandle {
    /// OS-assigned loopback port.
    pub port: u16,
    /// The minted bearer token.
    pub auth_token: Secret<String>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("port", &self.port)
            .field("auth_token", &"[redacted]")
            .finish()
    }
}

/// Which path serves sampling calls. `Mcp → Direct` latches one-way after
/// the first MCP failure; the reverse transition never happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Sampling through the upstream MCP client.
    Mcp,
    /// Sampling through the direct provider.
    Direct,
}

enum Lifecycle {
    Unstarted,
    Starting,
    Started(Running),
    Stopped,
}

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    serve_handle: JoinHandle<()>,
    port: u16,
}

/// State shared with the request handlers for the life of one execution.
struct BridgeShared {
    config: BridgeConfig,
    auth_token: Mutex<Option<Secret<String>>>,
    validator: RequestValidator,
    quota: QuotaLedger,
    filter: ContentFilter,
    provider: Option<Arc<dyn DirectProvider>>,
    mcp: Option<McpSamplingPath>,
    mode: Mutex<SamplingMode>,
    calls: Mutex<Vec<SamplingCall>>,
    active: AtomicUsize,
    started_at: Instant,
    frozen_elapsed: Mutex<Option<Duration>>,
}

impl BridgeShared {
    fn mode(&self) -> SamplingMode {
        *self.mode.lock()
    }

    fn latch_direct(&self) {
        let mut mode = self.mode.lock();
        if *mode == SamplingMode::Mcp {
            info!("MCP sampling path failed; latching to direct provider mode");
            *mode = SamplingMode::Direct;
        }
    }

    fn verify_token(&self, presented: &str) -> bool {
        let token = self.auth_token.lock();
        match token.as_ref() {
            Some(expected) => pontoon_auth::verify(presented, expected.expose_secret()),
            None => false,
        }
    }

    fn push_call(&self, call: SamplingCall) {
        self.calls.lock().push(call);
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.config.timeout_per_call_ms))
    }
}

/// RAII entry in the active-request set; `stop()` waits on the count.
struct ActiveGuard {
    shared: Arc<BridgeShared>,
}

impl ActiveGuard {
    fn new(shared: Arc<BridgeShared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ephemeral per-execution sampling bridge.
///
/// Single-use: the lifecycle runs `Unstarted → Started → Stopped` exactly
/// once. Construct with [`SamplingBridge::new`]; inject a provider double
/// with [`SamplingBridge::with_provider`] or let `start()` resolve one
/// from the environment.
pub struct SamplingBridge {
    config: BridgeConfig,
    injected_provider: Option<Arc<dyn DirectProvider>>,
    mcp_client: Option<Arc<dyn McpSampling>>,
    lifecycle: Mutex<Lifecycle>,
    shared: Mutex<Option<Arc<BridgeShared>>>,
}

impl SamplingBridge {
    /// Create an unstarted bridge from its configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            injected_provider: None,
            mcp_client: None,
            lifecycle: Mutex::new(Lifecycle::Unstarted),
            shared: Mutex::new(None),
        }
    }

    /// Use the given direct provider instead of resolving one from the
    /// environment at `start()`.
    pub fn with_provider(mut self, provider: Arc<dyn DirectProvider>) -> Self {
        self.injected_provider = Some(provider);
        self
    }

    /// Attach the upstream MCP client for the free sampling path.
    pub fn with_mcp_client(mut self, client: Arc<dyn McpSampling>) -> Self {
        self.mcp_client = Some(client);
        self
    }

    /// Mint a bearer token, bind a loopback listener on an OS-assigned
    /// port, and begin serving `/sample`.
    pub async fn start(&self) -> Result<BridgeHandle, BridgeError> {
        if !self.config.enabled {
            return Err(BridgeError::Disabled);
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Unstarted => *lifecycle = Lifecycle::Starting,
                _ => return Err(BridgeError::AlreadyStarted),
            }
        }

        match self.start_inner().await {
            Ok((handle, running)) => {
                *self.lifecycle.lock() = Lifecycle::Started(running);
                Ok(handle)
            }
            Err(e) => {
                *self.lifecycle.lock() = Lifecycle::Unstarted;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(BridgeHandle, Running), BridgeError> {
        let token = pontoon_auth::mint()?;
        let call_timeout = Duration::from_millis(u64::from(self.config.timeout_per_call_ms));

        let provider = self
            .injected_provider
            .clone()
            .or_else(|| provider_from_env(self.config.provider, call_timeout));
        let mcp = self.mcp_client.clone().map(McpSamplingPath::new);

        let mode = if mcp.as_ref().is_some_and(|m| m.supports_sampling()) {
            SamplingMode::Mcp
        } else {
            SamplingMode::Direct
        };

        let shared = Arc::new(BridgeShared {
            config: self.config.clone(),
            auth_token: Mutex::new(Some(token.clone())),
            validator: RequestValidator::new(),
            quota: QuotaLedger::new(QuotaLimits {
                max_rounds: self.config.max_rounds_per_execution,
                max_tokens: self.config.max_tokens_per_execution,
            }),
            filter: ContentFilter::new(),
            provider,
            mcp,
            mode: Mutex::new(mode),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            started_at: Instant::now(),
            frozen_elapsed: Mutex::new(None),
        });

        let app = Router::new()
            .route("/sample", post(handle_sample).fallback(not_found))
            .fallback(not_found)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .into_inner(),
            )
            .with_state(Arc::clone(&shared));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let serve_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("bridge server error: {e}");
            }
        });

        *self.shared.lock() = Some(Arc::clone(&shared));
        info!(port, ?mode, "sampling bridge started");

        Ok((
            BridgeHandle {
                port,
                auth_token: token,
            },
            Running {
                shutdown_tx,
                serve_handle,
                port,
            },
        ))
    }

    /// Stop accepting connections, drain in-flight responses, then close.
    ///
    /// No-op from `Unstarted` or `Stopped`. Polls the active-request set
    /// every [`GRACEFUL_SHUTDOWN_POLL_MS`] for up to
    /// [`GRACEFUL_SHUTDOWN_MAX_WAIT_MS`], then closes remaining sockets
    /// forcibly and clears the bridge identity.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Unstarted => {
                    *lifecycle = Lifecycle::Unstarted;
                    return Ok(());
                }
                Lifecycle::Starting => {
                    *lifecycle = Lifecycle::Starting;
                    return Ok(());
                }
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Started(running) => running,
            }
        };

        info!(port = running.port, "stopping sampling bridge");
        let _ = running.shutdown_tx.send(());

        let poll = Duration::from_millis(GRACEFUL_SHUTDOWN_POLL_MS);
        let shared = self.shared.lock().clone();
        if let Some(shared) = &shared {
            let deadline = Instant::now() + Duration::from_millis(GRACEFUL_SHUTDOWN_MAX_WAIT_MS);
            while shared.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                tokio::time::sleep(poll).await;
            }
            if shared.active.load(Ordering::SeqCst) > 0 {
                warn!("graceful drain deadline reached; closing remaining connections");
            }
        }

        // The serve future resolves once drained connections finish
        // flushing; anything still open after one more poll interval is
        // closed forcibly.
        let mut serve_handle = running.serve_handle;
        if tokio::time::timeout(poll, &mut serve_handle).await.is_err() {
            serve_handle.abort();
        }

        if let Some(shared) = shared {
            *shared.frozen_elapsed.lock() = Some(shared.started_at.elapsed());
            *shared.auth_token.lock() = None;
        }

        info!("sampling bridge stopped");
        Ok(())
    }

    /// Aggregate metrics for this execution. Readable in every lifecycle
    /// state; the duration freezes at `stop()`.
    pub fn sampling_metrics(&self) -> SamplingMetrics {
        let shared = self.shared.lock().clone();
        match shared {
            Some(shared) => {
                let snapshot = shared.quota.metrics();
                let elapsed = shared
                    .frozen_elapsed
                    .lock()
                    .unwrap_or_else(|| shared.started_at.elapsed());
                let average = if snapshot.rounds_used == 0 {
                    0.0
                } else {
                    f64::from(snapshot.tokens_used) / f64::from(snapshot.rounds_used)
                };
                SamplingMetrics {
                    total_rounds: snapshot.rounds_used,
                    total_tokens: snapshot.tokens_used,
                    total_duration_ms: elapsed.as_millis() as u64,
                    average_tokens_per_round: average,
                    quota_remaining: shared.quota.remaining(),
                }
            }
            None => SamplingMetrics {
                total_rounds: 0,
                total_tokens: 0,
                total_duration_ms: 0,
                average_tokens_per_round: 0.0,
                quota_remaining: QuotaRemaining {
                    rounds: self.config.max_rounds_per_execution,
                    tokens: self.config.max_tokens_per_execution,
                },
            },
        }
    }

    /// Snapshot copy of the accumulated audit records; later mutations are
    /// not observable through it.
    pub fn sampling_calls(&self) -> Vec<SamplingCall> {
        self.shared
            .lock()
            .as_ref()
            .map(|shared| shared.calls.lock().clone())
            .unwrap_or_default()
    }

    /// The current sampling mode; `None` before `start()`.
    pub fn sampling_mode(&self) -> Option<SamplingMode> {
        self.shared.lock().as_ref().map(|shared| shared.mode())
    }
}

//─────────────────────────────
//  Request dispatch
//─────────────────────────────

async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, ErrorBody::new("Not found"))
}

async fn handle_sample(
    State(shared): State<Arc<BridgeShared>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let guard = ActiveGuard::new(Arc::clone(&shared));

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(presented) = presented else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            ErrorBody::new("Missing or invalid authorization header"),
        );
    };
    if !shared.verify_token(presented) {
        return json_error(StatusCode::UNAUTHORIZED, ErrorBody::new("Auth token invalid"));
    }

    let request = match shared.validator.validate(&body) {
        Ok(request) => request,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, ErrorBody::new(e.to_string())),
    };

    if let Err(e) = shared.quota.preflight() {
        return json_error(StatusCode::TOO_MANY_REQUESTS, ErrorBody::new(e.to_string()));
    }

    if let Some(prompt) = request.system_prompt.as_deref() {
        if !prompt.is_empty() && !shared.config.allowed_system_prompts.contains(prompt) {
            return json_error(
                StatusCode::FORBIDDEN,
                ErrorBody::new(format!(
                    "System prompt not in allowlist: {}",
                    truncate_prompt(prompt)
                )),
            );
        }
    }

    let model = request.model.clone().unwrap_or_else(|| default_model(&shared));
    if !shared.config.allowed_models.contains(&model) {
        let mut allowed: Vec<&str> = shared
            .config
            .allowed_models
            .iter()
            .map(String::as_str)
            .collect();
        allowed.sort_unstable();
        return json_error(
            StatusCode::BAD_REQUEST,
            ErrorBody::new(format!(
                "Model not allowed: {model}. Allowed models: {}",
                allowed.join(", ")
            )),
        );
    }

    let max_tokens = request
        .max_tokens
        .unwrap_or(DEFAULT_MAX_TOKENS)
        .min(MAX_TOKENS_CAP);

    let sampling = SamplingRequest {
        messages: request.provider_messages(),
        system_prompt: request.system_prompt.clone().filter(|p| !p.is_empty()),
        model,
        max_tokens,
    };

    if request.stream {
        dispatch_streaming(shared, sampling, guard)
    } else {
        dispatch_unary(shared, sampling, guard).await
    }
}

fn default_model(shared: &BridgeShared) -> String {
    shared
        .provider
        .as_ref()
        .map(|provider| provider.default_model().to_string())
        .unwrap_or_else(|| shared.config.provider.default_model().to_string())
}

fn truncate_prompt(prompt: &str) -> String {
    if prompt.chars().count() > MAX_SYSTEM_PROMPT_ERROR_LENGTH {
        let shown: String = prompt.chars().take(MAX_SYSTEM_PROMPT_ERROR_LENGTH).collect();
        format!("{shown}...")
    } else {
        prompt.to_string()
    }
}

//─────────────────────────────
//  Unary dispatch
//─────────────────────────────

async fn dispatch_unary(
    shared: Arc<BridgeShared>,
    request: SamplingRequest,
    guard: ActiveGuard,
) -> Response {
    let _guard = guard;
    let started = Instant::now();
    let timeout = shared.call_timeout();

    let mut via_mcp = false;
    let mut mcp_response: Option<LlmResponse> = None;

    if shared.mode() == SamplingMode::Mcp {
        if let Some(mcp) = shared.mcp.clone() {
            match tokio::time::timeout(timeout, mcp.try_create_message(&request)).await {
                Ok(Some(response)) => {
                    via_mcp = true;
                    mcp_response = Some(response);
                }
                Ok(None) => shared.latch_direct(),
                Err(_) => {
                    warn!("MCP sampling timed out");
                    shared.latch_direct();
                }
            }
        }
    }

    let response = match mcp_response {
        Some(response) => response,
        None => {
            let Some(provider) = shared.provider.clone() else {
                return no_backend_response(&shared);
            };
            match tokio::time::timeout(timeout, provider.generate_message(&request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody::new("Provider API error").with_details(e.to_string()),
                    )
                }
                Err(_) => {
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody::new("Provider API error").with_details(format!(
                            "upstream call exceeded the {}ms deadline",
                            timeout.as_millis()
                        )),
                    )
                }
            }
        }
    };

    // The MCP path reports no token counts; charge the capped request
    // budget as a conservative estimate.
    let tokens_used = if via_mcp {
        request.max_tokens
    } else {
        response.usage.map(|usage| usage.total()).unwrap_or(0)
    };

    if let Err(e) = shared.quota.commit_round(tokens_used) {
        return json_error(StatusCode::TOO_MANY_REQUESTS, ErrorBody::new(e.to_string()));
    }

    let mut response = response;
    if shared.config.content_filtering_enabled {
        let outcome = shared.filter.scan(&response.text());
        response.content = vec![ContentBlock::Text {
            text: outcome.filtered,
        }];
    }

    shared.push_call(SamplingCall {
        model: request.model.clone(),
        messages: request.messages.clone(),
        system_prompt: request.system_prompt.clone(),
        response: response.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        tokens_used,
        timestamp: Utc::now(),
    });

    debug!(via_mcp, tokens_used, "sampling round completed");
    (StatusCode::OK, Json(response)).into_response()
}

fn no_backend_response(shared: &BridgeShared) -> Response {
    let debug = json!({
        "samplingMode": shared.mode(),
        "mcpClientPresent": shared.mcp.is_some(),
        "providerConfigured": shared.provider.is_some(),
        "provider": shared.config.provider.as_str(),
    });
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        ErrorBody::new("No sampling backend available").with_debug(debug),
    )
}

//─────────────────────────────
//  Streaming dispatch
//─────────────────────────────

fn dispatch_streaming(
    shared: Arc<BridgeShared>,
    request: SamplingRequest,
    guard: ActiveGuard,
) -> Response {
    // Streaming is supported only over a direct provider.
    let Some(provider) = shared.provider.clone() else {
        return no_backend_response(&shared);
    };

    // Book the round before any byte is flushed; token accounting settles
    // when the stream completes.
    if let Err(e) = shared.quota.begin_streaming_round() {
        return json_error(StatusCode::TOO_MANY_REQUESTS, ErrorBody::new(e.to_string()));
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(pump_stream(Arc::clone(&shared), provider, request, tx, guard));

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::convert::Infallible>(frame), rx))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .expect("static response parts are valid")
}

async fn pump_stream(
    shared: Arc<BridgeShared>,
    provider: Arc<dyn DirectProvider>,
    request: SamplingRequest,
    tx: mpsc::Sender<Bytes>,
    guard: ActiveGuard,
) {
    let _guard = guard;
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + shared.call_timeout();

    let mut stream =
        match tokio::time::timeout_at(deadline, provider.stream_message(&request)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.quota.rollback_streaming_round();
                send_error_frame(&tx, "Provider API error", Some(e.to_string())).await;
                return;
            }
            Err(_) => {
                shared.quota.rollback_streaming_round();
                send_error_frame(&tx, "Provider API error", Some("upstream call timed out".into()))
                    .await;
                return;
            }
        };

    let mut full_text = String::new();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let event = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(event) => event,
            Err(_) => {
                shared.quota.rollback_streaming_round();
                send_error_frame(&tx, "Provider API error", Some("upstream call timed out".into()))
                    .await;
                return;
            }
        };

        match event {
            None => break,
            Some(Ok(StreamEvent::Chunk(chunk))) => {
                let chunk = if shared.config.content_filtering_enabled {
                    shared.filter.scan(&chunk).filtered
                } else {
                    chunk
                };
                full_text.push_str(&chunk);
                let frame = data_frame(&json!({"type": "chunk", "content": chunk}));
                if tx.send(frame).await.is_err() {
                    // Client went away; stop iterating, no further work.
                    debug!("client disconnected mid-stream");
                    return;
                }
            }
            Some(Ok(StreamEvent::Usage(reported))) => usage = Some(reported),
            Some(Err(e)) => {
                shared.quota.rollback_streaming_round();
                send_error_frame(&tx, "Provider API error", Some(e.to_string())).await;
                return;
            }
        }
    }

    let usage = usage.unwrap_or(TokenUsage {
        input_tokens: 0,
        output_tokens: 0,
    });
    let tokens_used = usage.total();

    if let Err(e) = shared.quota.settle_streaming_round(tokens_used) {
        let _ = tx.send(data_frame(&json!({"error": e.to_string()}))).await;
        return;
    }

    shared.push_call(SamplingCall {
        model: request.model.clone(),
        messages: request.messages.clone(),
        system_prompt: request.system_prompt.clone(),
        response: LlmResponse {
            content: vec![ContentBlock::Text {
                text: full_text.clone(),
            }],
            stop_reason: None,
            model: Some(request.model.clone()),
            usage: Some(usage),
        },
        duration_ms: started.elapsed().as_millis() as u64,
        tokens_used,
        timestamp: Utc::now(),
    });

    let done = json!({
        "type": "done",
        "content": full_text,
        "usage": {
            "inputTokens": usage.input_tokens,
            "outputTokens": usage.output_tokens,
        },
    });
    let _ = tx.send(data_frame(&done)).await;
    debug!(tokens_used, "streaming round completed");
}

//─────────────────────────────
//  Response helpers
//─────────────────────────────

fn json_error(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

/// One SSE frame. `serde_json` escapes control characters, so the payload
/// never contains a raw newline.
fn data_frame(value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

async fn send_error_frame(tx: &mpsc::Sender<Bytes>, error: &str, details: Option<String>) {
    let mut payload = json!({ "error": error });
    if let Some(details) = details {
        payload["details"] = json!(details);
    }
    let _ = tx.send(data_frame(&payload)).await;
}
