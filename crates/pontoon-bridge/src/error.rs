//! Bridge lifecycle errors and the JSON error body shape.

use serde::Serialize;
use thiserror::Error;

/// Failures starting or stopping a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The configuration disables the bridge entirely.
    #[error("sampling bridge is disabled by configuration")]
    Disabled,

    /// `start()` was called on an instance that already left `Unstarted`.
    #[error("sampling bridge already started")]
    AlreadyStarted,

    /// Token minting failed (OS entropy source).
    #[error(transparent)]
    Token(#[from] pontoon_auth::TokenError),

    /// Binding the loopback listener failed.
    #[error("failed to bind loopback listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// The JSON body every error response carries.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            debug: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_debug(mut self, debug: serde_json::Value) -> Self {
        self.debug = Some(debug);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_omits_empty_fields() {
        let value = serde_json::to_value(ErrorBody::new("Not found")).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["error"], "Not found");
    }

    #[test]
    fn error_body_carries_details_and_debug() {
        let body = ErrorBody::new("Provider API error")
            .with_details("upstream returned 500")
            .with_debug(serde_json::json!({"provider": "anthropic"}));
        let value = serde_json::to_value(body).unwrap();
        assert_eq!(value["details"], "upstream returned 500");
        assert_eq!(value["debug"]["provider"], "anthropic");
    }
}
