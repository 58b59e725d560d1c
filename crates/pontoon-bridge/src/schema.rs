//! Strict request-body validation for `POST /sample`.
//!
//! The validator walks the raw JSON itself instead of deserializing
//! straight into a struct, so it can collect *every* structural error
//! rather than stopping at the first, and reject unknown fields at the
//! top level, the message level, and inside content items.

use pontoon_provider::{ChatMessage, ChatRole};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Largest `maxTokens` a request may ask for.
pub const MAX_REQUEST_MAX_TOKENS: u64 = 100_000;

const TOP_LEVEL_FIELDS: &[&str] = &["messages", "model", "maxTokens", "systemPrompt", "stream"];
const MESSAGE_FIELDS: &[&str] = &["role", "content"];
const CONTENT_ITEM_FIELDS: &[&str] = &["type", "text"];

/// Validation failure for a request body.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// The body was not JSON at all.
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),
    /// The body was JSON but violated the schema. Carries every violation.
    #[error("Invalid request: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A validated `/sample` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    /// Conversation turns, oldest first. Never empty.
    pub messages: Vec<RequestMessage>,
    /// Requested model, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Requested completion budget, if any. Already range-checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Requested system prompt, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Whether the caller asked for an SSE stream.
    pub stream: bool,
}

/// One request message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMessage {
    /// Author of the turn.
    pub role: ChatRole,
    /// Turn content.
    pub content: MessageContent,
}

/// Message content: a bare string or a sequence of typed items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content.
    Text(String),
    /// Structured content items.
    Parts(Vec<ContentItem>),
}

/// One structured content item. Only `type` is mandatory; items whose type
/// is not `"text"` are projected by whatever `text` they carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentItem {
    /// Item type tag.
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item text, mandatory when `item_type == "text"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl RequestMessage {
    /// Flatten the content to plain text. Structured items contribute the
    /// concatenation of whatever `text` fields are present.
    pub fn flattened_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(items) => items
                .iter()
                .filter_map(|item| item.text.as_deref())
                .collect(),
        }
    }
}

impl BridgeRequest {
    /// Project the request messages into the provider message shape.
    pub fn provider_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|message| ChatMessage {
                role: message.role,
                content: message.flattened_text(),
            })
            .collect()
    }
}

/// Request validator, compiled once per bridge instance.
#[derive(Debug, Default)]
pub struct RequestValidator {
    _priv: (),
}

impl RequestValidator {
    /// Build the validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a raw request body.
    pub fn validate(&self, body: &[u8]) -> Result<BridgeRequest, ValidateError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ValidateError::MalformedJson(e.to_string()))?;

        let Some(root) = value.as_object() else {
            return Err(ValidateError::Invalid(vec![
                "request body must be a JSON object".into(),
            ]));
        };

        let mut errors: Vec<String> = Vec::new();

        for key in root.keys() {
            if !TOP_LEVEL_FIELDS.contains(&key.as_str()) {
                errors.push(format!("unknown field \"{key}\""));
            }
        }

        let messages = match root.get("messages") {
            None => {
                errors.push("messages: required".into());
                Vec::new()
            }
            Some(Value::Array(items)) => {
                if items.is_empty() {
                    errors.push("messages: must contain at least one message".into());
                }
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(index, item)| validate_message(index, item, &mut errors))
                    .collect()
            }
            Some(_) => {
                errors.push("messages: must be an array".into());
                Vec::new()
            }
        };

        let model = match root.get("model") {
            None => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(_) => {
                errors.push("model: must be a non-empty string".into());
                None
            }
        };

        let max_tokens = match root.get("maxTokens") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(n) if (1..=MAX_REQUEST_MAX_TOKENS).contains(&n) => Some(n as u32),
                _ => {
                    errors.push(format!(
                        "maxTokens: must be an integer between 1 and {MAX_REQUEST_MAX_TOKENS}"
                    ));
                    None
                }
            },
        };

        let system_prompt = match root.get("systemPrompt") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                errors.push("systemPrompt: must be a string".into());
                None
            }
        };

        let stream = match root.get("stream") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                errors.push("stream: must be a boolean".into());
                false
            }
        };

        if !errors.is_empty() {
            return Err(ValidateError::Invalid(errors));
        }

        Ok(BridgeRequest {
            messages,
            model,
            max_tokens,
            system_prompt,
            stream,
        })
    }
}

fn validate_message(
    index: usize,
    value: &Value,
    errors: &mut Vec<String>,
) -> Option<RequestMessage> {
    let Some(message) = value.as_object() else {
        errors.push(format!("messages[{index}]: must be an object"));
        return None;
    };

    for key in message.keys() {
        if !MESSAGE_FIELDS.contains(&key.as_str()) {
            errors.push(format!("messages[{index}]: unknown field \"{key}\""));
        }
    }

    let role = match message.get("role").and_then(Value::as_str) {
        Some("user") => Some(ChatRole::User),
        Some("assistant") => Some(ChatRole::Assistant),
        Some("system") => Some(ChatRole::System),
        Some(other) => {
            errors.push(format!(
                "messages[{index}].role: \"{other}\" is not one of user, assistant, system"
            ));
            None
        }
        None => {
            errors.push(format!(
                "messages[{index}].role: required, one of user, assistant, system"
            ));
            None
        }
    };

    let content = match message.get("content") {
        Some(Value::String(text)) => Some(MessageContent::Text(text.clone())),
        Some(Value::Array(items)) => {
            let parts: Vec<ContentItem> = items
                .iter()
                .enumerate()
                .filter_map(|(item_index, item)| {
                    validate_content_item(index, item_index, item, errors)
                })
                .collect();
            Some(MessageContent::Parts(parts))
        }
        Some(_) => {
            errors.push(format!(
                "messages[{index}].content: must be a string or an array of content items"
            ));
            None
        }
        None => {
            errors.push(format!("messages[{index}].content: required"));
            None
        }
    };

    Some(RequestMessage {
        role: role?,
        content: content?,
    })
}

fn validate_content_item(
    message_index: usize,
    item_index: usize,
    value: &Value,
    errors: &mut Vec<String>,
) -> Option<ContentItem> {
    let location = format!("messages[{message_index}].content[{item_index}]");

    let Some(item) = value.as_object() else {
        errors.push(format!("{location}: must be an object"));
        return None;
    };

    for key in item.keys() {
        if !CONTENT_ITEM_FIELDS.contains(&key.as_str()) {
            errors.push(format!("{location}: unknown field \"{key}\""));
        }
    }

    let item_type = match item.get("type") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{location}.type: must be a string"));
            None
        }
        None => {
            errors.push(format!("{location}.type: required"));
            None
        }
    };

    let text = match item.get("text") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{location}.text: must be a string"));
            None
        }
    };

    let item_type = item_type?;
    if item_type == "text" && text.is_none() {
        errors.push(format!(
            "{location}.text: required when type is \"text\""
        ));
        return None;
    }

    Some(ContentItem { item_type, text })
}
