//! Provider selection: a closed set of provider tags and an environment
//! driven factory.
//!
//! Credentials are read from one named environment variable per provider.
//! An absent or unusable credential yields `None` rather than an error; the
//! bridge then starts without a direct back-end and answers 503 on
//! sampling attempts.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::Secret;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{anthropic, openai, AnthropicProvider, DirectProvider, OpenAiProvider};

/// The closed set of supported direct providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    /// Anthropic messages API.
    Anthropic,
    /// OpenAI chat-completions API.
    OpenAi,
}

impl ProviderTag {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Anthropic => "anthropic",
            ProviderTag::OpenAi => "openai",
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderTag::Anthropic => "ANTHROPIC_API_KEY",
            ProviderTag::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Fallback model when neither the request nor the provider instance
    /// names one.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderTag::Anthropic => anthropic::DEFAULT_MODEL,
            ProviderTag::OpenAi => openai::DEFAULT_MODEL,
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the tagged provider from the environment, or `None` when its
/// credential is absent or rejected.
pub fn provider_from_env(
    tag: ProviderTag,
    timeout: Duration,
) -> Option<Arc<dyn DirectProvider>> {
    let key = env::var(tag.api_key_var()).ok()?;
    if key.trim().is_empty() {
        return None;
    }
    let key = Secret::new(key);

    let built: Result<Arc<dyn DirectProvider>, _> = match tag {
        ProviderTag::Anthropic => {
            AnthropicProvider::new(key, timeout).map(|p| Arc::new(p) as Arc<dyn DirectProvider>)
        }
        ProviderTag::OpenAi => {
            OpenAiProvider::new(key, timeout).map(|p| Arc::new(p) as Arc<dyn DirectProvider>)
        }
    };

    match built {
        Ok(provider) => Some(provider),
        Err(e) => {
            warn!(provider = %tag, "direct provider unavailable: {e}");
            None
        }
    }
}
