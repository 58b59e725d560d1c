#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **pontoon-bridge** – Ephemeral sampling bridge for sandboxed executions.
//!
//! The bridge is a per-execution HTTP proxy: the orchestrator constructs a
//! [`SamplingBridge`], `start()` binds a loopback listener on an OS-chosen
//! port and mints a fresh bearer token, and the sandbox is handed
//! `{port, auth_token}`. Sandboxed code then issues `POST /sample` calls,
//! which the bridge authenticates, validates, meters against per-execution
//! quotas, dispatches to the MCP sampling path or a direct LLM provider
//! (with a one-way `mcp → direct` fallback latch), filters, and answers as
//! unary JSON or a Server-Sent-Events stream. `stop()` drains in-flight
//! responses and tears the listener down.
//!
//! One bridge instance serves exactly one execution: the lifecycle is
//! `Unstarted → Started → Stopped`, one-way, single-use. Instances share
//! no process-wide state and may coexist freely.

pub mod config;
pub mod records;
pub mod schema;
pub mod server;

mod error;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use records::{SamplingCall, SamplingMetrics};
pub use schema::{BridgeRequest, RequestValidator, ValidateError};
pub use server::{BridgeHandle, SamplingBridge, SamplingMode};

/// Completion token ceiling applied when the request does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 1_000;

/// Hard ceiling on the per-call completion token budget.
pub const MAX_TOKENS_CAP: u32 = 10_000;

/// Rejected system prompts are truncated to this many characters in the
/// 403 error body.
pub const MAX_SYSTEM_PROMPT_ERROR_LENGTH: usize = 100;

/// Drain poll interval during graceful shutdown, in milliseconds.
pub const GRACEFUL_SHUTDOWN_POLL_MS: u64 = 100;

/// Upper bound on the graceful drain, in milliseconds; sockets still open
/// after this are closed forcibly.
pub const GRACEFUL_SHUTDOWN_MAX_WAIT_MS: u64 = 5_000;
