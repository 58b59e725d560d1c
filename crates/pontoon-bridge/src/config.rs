//! Bridge configuration, provided in-process by the orchestrator.

use std::collections::HashSet;

use pontoon_provider::ProviderTag;

/// Immutable per-execution configuration for one [`crate::SamplingBridge`].
///
/// The bridge does not discover or persist configuration itself; the
/// orchestrator builds this once per execution. Provider credentials are
/// not part of the config — they are read from the provider's named
/// environment variable when `start()` resolves a back-end.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Master switch. When false, `start()` refuses.
    pub enabled: bool,
    /// Which direct provider backs the bridge.
    pub provider: ProviderTag,
    /// Hard ceiling on the number of sampling calls.
    pub max_rounds_per_execution: u32,
    /// Hard ceiling on cumulative input+output tokens.
    pub max_tokens_per_execution: u32,
    /// Per-upstream-call deadline in milliseconds.
    pub timeout_per_call_ms: u32,
    /// Exact-match allowlist for the request system prompt. The empty
    /// prompt is always allowed.
    pub allowed_system_prompts: HashSet<String>,
    /// Exact-match allowlist for the model, applied after defaulting.
    pub allowed_models: HashSet<String>,
    /// Whether outbound text is passed through the content filter.
    pub content_filtering_enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: ProviderTag::Anthropic,
            max_rounds_per_execution: 10,
            max_tokens_per_execution: 100_000,
            timeout_per_call_ms: 30_000,
            allowed_system_prompts: HashSet::from([String::new()]),
            allowed_models: HashSet::from([
                ProviderTag::Anthropic.default_model().to_string(),
                ProviderTag::OpenAi.default_model().to_string(),
            ]),
            content_filtering_enabled: true,
        }
    }
}
