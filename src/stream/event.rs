//! Stream event model
//!
//! [`StreamEvent`] is the closed set of events exchanged on the wire: the
//! generation backend emits them inside `data:` lines and the relay emits
//! them to the browser. Upstream field names vary between workflow versions,
//! so deserialization accepts a few aliases while serialization always uses
//! the canonical names.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Progress annotation carried by `status` and `progress` events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Machine readable stage name
    #[serde(default)]
    pub stage: String,

    /// Human readable description of the stage
    #[serde(default)]
    pub message: String,

    /// Completion estimate in percent
    #[serde(
        default,
        alias = "progress",
        deserialize_with = "deserialize_percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub percent: Option<u8>,

    /// Time since the turn started (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, message: impl Into<String>, percent: u8) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            percent: Some(percent.min(100)),
            elapsed_ms: None,
        }
    }
}

fn deserialize_percent<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(|p| p.clamp(0.0, 100.0).round() as u8))
}

/// Events of a chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Stage change of the generation
    Status(ProgressUpdate),

    /// Percent update of the generation
    Progress(ProgressUpdate),

    /// A piece of answer text
    Text {
        #[serde(alias = "content", alias = "chunk")]
        text: String,
    },

    /// Replaces the reference list of the answer
    Sources {
        #[serde(default, alias = "list", alias = "references", alias = "citations")]
        sources: Vec<Value>,
    },

    /// Structured analytics payload
    Analytics {
        #[serde(default, alias = "payload")]
        data: Value,
    },

    /// Terminal failure of the turn
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },

    /// End of the turn
    Done {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sources: Vec<Value>,
    },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn done() -> Self {
        Self::Done {
            sources: Vec::new(),
        }
    }

    /// Event name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Progress(_) => "progress",
            Self::Text { .. } => "text",
            Self::Sources { .. } => "sources",
            Self::Analytics { .. } => "analytics",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// JSON body of the SSE `data:` field
    pub fn to_json(&self) -> String {
        // Every variant holds JSON-safe data, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }

    /// Complete SSE frame (`data: <json>\n\n`)
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Parse the payload of an upstream `data:` line
///
/// Returns `Ok(None)` for payloads that carry no event (empty lines, JSON
/// without a known `type`), and treats the `[DONE]` sentinel as
/// [`StreamEvent::Done`].
///
/// # Errors
///
/// Returns [`RelayError::Decode`] when the payload is not valid JSON.
pub fn parse_upstream_event(payload: &str) -> Result<Option<StreamEvent>> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.eq_ignore_ascii_case("[DONE]") {
        return Ok(Some(StreamEvent::done()));
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| RelayError::Decode(format!("invalid event payload: {}", e)))?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        tracing::debug!("Ignoring upstream event without type");
        return Ok(None);
    };

    match serde_json::from_value::<StreamEvent>(value.clone()) {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            tracing::debug!(kind = %kind, error = %e, "Ignoring unrecognized upstream event");
            Ok(None)
        }
    }
}
