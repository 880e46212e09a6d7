//! Chat request normalization
//!
//! Validates an incoming chat request and builds the payload posted to the
//! generation backend. Document context is truncated per document and
//! wrapped in boundary markers so later citation extraction can attribute
//! text to its source document. Nothing in this module touches the network.

use crate::config::LimitsConfig;
use crate::error::{RelayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Action name expected by the chat workflow
pub const WEBHOOK_ACTION: &str = "sendMessage";

/// Tool name sent when the request selects none
pub const DEFAULT_TOOL: &str = "default";

/// Chat request as posted by the browser
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Raw user message
    pub message: String,

    /// Tools the user enabled for this turn
    #[serde(default)]
    pub tools: Vec<String>,

    /// Client side conversation key forwarded to the workflow
    #[serde(default)]
    pub session_key: Option<String>,

    /// Existing chat session id; a new session is created when absent
    #[serde(default)]
    pub session_id: Option<String>,

    /// Owning user
    pub user_id: String,

    /// Documents attached as additional context
    #[serde(default)]
    pub document_context: Option<Vec<ContextDocument>>,
}

/// A document attached to a chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDocument {
    /// Document identifier used in the boundary markers
    pub id: String,

    /// Optional human readable title
    #[serde(default)]
    pub title: Option<String>,

    /// Document text
    #[serde(alias = "text")]
    pub content: String,
}

/// Payload posted to the generation backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub action: String,
    pub message: String,
    pub tools: Vec<String>,
    pub tool: String,
    pub session_key: String,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: String,
}

/// Result of normalizing a [`ChatRequest`]
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Outbound payload, including any document context
    pub payload: WebhookPayload,
    /// Sanitized user message without document context (what gets stored)
    pub user_message: String,
    /// Whether document context was attached
    pub has_documents: bool,
}

/// Validates chat requests and builds webhook payloads
#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    limits: LimitsConfig,
}

impl RequestNormalizer {
    /// Create a normalizer enforcing the given limits
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Validate `request` and build the outbound payload
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Validation`] when the message is empty, too
    /// long, contains disallowed markup, when too many tools are requested,
    /// or when the user id is missing.
    pub fn normalize(&self, request: &ChatRequest) -> Result<NormalizedRequest> {
        if request.user_id.trim().is_empty() {
            return Err(RelayError::Validation("userId is required".to_string()).into());
        }

        if request.tools.len() > self.limits.max_tools {
            return Err(RelayError::Validation(format!(
                "at most {} tools may be selected, got {}",
                self.limits.max_tools,
                request.tools.len()
            ))
            .into());
        }

        if contains_disallowed_markup(&request.message) {
            return Err(
                RelayError::Validation("message contains disallowed markup".to_string()).into(),
            );
        }

        let user_message = sanitize_message(&request.message);
        if user_message.is_empty() {
            return Err(RelayError::Validation("message cannot be empty".to_string()).into());
        }

        let length = user_message.chars().count();
        if length > self.limits.max_message_length {
            return Err(RelayError::Validation(format!(
                "message is too long ({} characters, maximum {})",
                length, self.limits.max_message_length
            ))
            .into());
        }

        let documents = request
            .document_context
            .as_deref()
            .filter(|docs| !docs.is_empty());

        let message = match documents {
            Some(docs) => {
                tracing::debug!(documents = docs.len(), "Attaching document context");
                format!(
                    "{}\n\n{}",
                    user_message,
                    build_document_context(docs, self.limits.max_document_bytes)
                )
            }
            None => user_message.clone(),
        };

        let session_id = request.session_id.clone().unwrap_or_default();
        let session_key = request
            .session_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| session_id.clone());

        let payload = WebhookPayload {
            action: WEBHOOK_ACTION.to_string(),
            message,
            tools: request.tools.clone(),
            tool: request
                .tools
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            session_key,
            session_id,
            user_id: request.user_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        Ok(NormalizedRequest {
            payload,
            user_message,
            has_documents: documents.is_some(),
        })
    }
}

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)<\s*/?\s*(script|iframe|object|embed)\b|javascript\s*:|\bon[a-z]+\s*=\s*["']"#,
        )
        .expect("static markup pattern is valid")
    })
}

/// Whether `input` contains markup that is never accepted in a message
pub fn contains_disallowed_markup(input: &str) -> bool {
    markup_pattern().is_match(input)
}

/// Strip control characters (keeping newlines and tabs) and trim
///
/// Applying it twice yields the same result as applying it once.
pub fn sanitize_message(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Render documents as a bounded context block
///
/// Each document body is cut to at most `max_bytes` bytes on a character
/// boundary and wrapped in `[Document <id>]` / `[End Document <id>]`.
pub fn build_document_context(documents: &[ContextDocument], max_bytes: usize) -> String {
    let mut out = String::from("--- Document Context ---");
    for doc in documents {
        let body = truncate_utf8(&doc.content, max_bytes);
        if body.len() < doc.content.len() {
            tracing::debug!(
                document = %doc.id,
                original_bytes = doc.content.len(),
                kept_bytes = body.len(),
                "Truncated context document"
            );
        }

        out.push_str("\n\n[Document ");
        out.push_str(&doc.id);
        out.push(']');
        if let Some(title) = doc.title.as_deref().filter(|t| !t.is_empty()) {
            out.push(' ');
            out.push_str(title);
        }
        out.push('\n');
        out.push_str(body);
        out.push_str("\n[End Document ");
        out.push_str(&doc.id);
        out.push(']');
    }
    out
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
