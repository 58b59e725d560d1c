//! The MCP sampling path: sampling through the upstream MCP client's
//! `createMessage` capability.
//!
//! The adapter's job is to absorb MCP-client quirks, not to propagate
//! them: [`McpSamplingPath::try_create_message`] turns every failure into
//! `None`. The caller treats `None` as "this path is gone" and latches to
//! its direct provider. The MCP path reports no token counts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{LlmResponse, SamplingRequest};

/// Contract of the upstream MCP client, as far as sampling is concerned.
///
/// The concrete client lives in the outer host; the bridge only needs to
/// know whether the capability was advertised and how to invoke it.
#[async_trait]
pub trait McpSampling: Send + Sync {
    /// Whether the connected client advertised the sampling capability.
    fn supports_sampling(&self) -> bool;

    /// Ask the client to run one completion on its own model access.
    async fn create_message(&self, request: &SamplingRequest) -> anyhow::Result<LlmResponse>;
}

/// Null-absorbing adapter over an upstream [`McpSampling`] client.
#[derive(Clone)]
pub struct McpSamplingPath {
    client: Arc<dyn McpSampling>,
}

impl McpSamplingPath {
    /// Wrap an upstream client.
    pub fn new(client: Arc<dyn McpSampling>) -> Self {
        Self { client }
    }

    /// Whether the upstream client advertised sampling.
    pub fn supports_sampling(&self) -> bool {
        self.client.supports_sampling()
    }

    /// Run one completion through the MCP client. Returns `None` on any
    /// failure, including an unadvertised capability; never errors.
    pub async fn try_create_message(&self, request: &SamplingRequest) -> Option<LlmResponse> {
        if !self.client.supports_sampling() {
            return None;
        }

        match self.client.create_message(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("MCP sampling failed: {e:#}");
                None
            }
        }
    }
}
