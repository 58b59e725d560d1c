//! Audit records and metrics for one bridge execution.

use chrono::{DateTime, Utc};
use pontoon_provider::{ChatMessage, LlmResponse};
use pontoon_quota::QuotaRemaining;
use serde::Serialize;

/// Append-only audit record for one successful sampling round. Held in
/// memory for the execution and read by the orchestrator after `stop()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingCall {
    /// Model that served the round.
    pub model: String,
    /// Messages sent upstream (flattened text form).
    pub messages: Vec<ChatMessage>,
    /// System prompt, if one was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// The (filtered) response returned to the sandbox.
    pub response: LlmResponse,
    /// Wall-clock duration of the round.
    pub duration_ms: u64,
    /// Tokens charged against the execution budget.
    pub tokens_used: u32,
    /// Completion time, UTC.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate sampling metrics for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingMetrics {
    /// Rounds consumed.
    pub total_rounds: u32,
    /// Tokens consumed.
    pub total_tokens: u32,
    /// Wall-clock milliseconds since `start()`, frozen at `stop()`.
    pub total_duration_ms: u64,
    /// Mean tokens per round; zero when no round completed.
    pub average_tokens_per_round: f64,
    /// Headroom left under the execution ceilings.
    pub quota_remaining: QuotaRemaining,
}
