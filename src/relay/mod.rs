//! Generation backend client
//!
//! A chat turn is one POST to the workflow webhook. The response is either
//! an SSE stream, relayed as it arrives, or a buffered JSON/text body that
//! is parsed up front. A backend whose workflow is not active is reported as
//! [`RelayResponse::Inactive`] so the turn can degrade to the canned
//! fallback stream instead of failing.

pub mod fallback;

use crate::config::WebhookConfig;
use crate::error::{RelayError, Result};
use crate::request::NormalizedRequest;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Header carrying the workflow execution id
pub const EXECUTION_ID_HEADER: &str = "x-execution-id";

const TEXT_FIELDS: &[&str] = &["response", "output", "text", "message", "content"];
const SOURCE_FIELDS: &[&str] = &["sources", "references", "citations"];
const EXECUTION_ID_FIELDS: &[&str] = &["executionId", "__executionId"];

/// Raw upstream body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Parsed non-streaming answer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedResponse {
    pub text: String,
    pub sources: Vec<Value>,
    pub analytics: Option<Value>,
    pub execution_id: Option<String>,
}

/// Shape of the backend's answer
pub enum RelayResponse {
    /// `text/event-stream` body, still being produced
    Streaming {
        body: ByteStream,
        execution_id: Option<String>,
    },
    /// Complete JSON or text body
    Buffered(BufferedResponse),
    /// The workflow is not active; `reason` is the upstream body
    Inactive { reason: String },
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming { execution_id, .. } => f
                .debug_struct("Streaming")
                .field("execution_id", execution_id)
                .finish_non_exhaustive(),
            Self::Buffered(response) => f.debug_tuple("Buffered").field(response).finish(),
            Self::Inactive { reason } => {
                f.debug_struct("Inactive").field("reason", reason).finish()
            }
        }
    }
}

impl RelayResponse {
    /// Label used in logs and metrics
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Streaming { .. } => "stream",
            Self::Buffered(_) => "buffered",
            Self::Inactive { .. } => "fallback",
        }
    }

    /// Execution id to hand to the progress tracker, if the backend sent one
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Streaming { execution_id, .. } => execution_id.as_deref(),
            Self::Buffered(response) => response.execution_id.as_deref(),
            Self::Inactive { .. } => None,
        }
    }
}

/// Client for the workflow webhook
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: Client,
    config: WebhookConfig,
}

impl WebhookClient {
    /// Create a client for the configured webhook
    ///
    /// Timeouts are applied per call (see [`WebhookClient::send`]) because
    /// they depend on whether the request carries documents.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// POST the normalized request to the webhook
    ///
    /// The timeout covers connecting, the response head and, for buffered
    /// responses, the whole body. Streaming bodies are not bounded once
    /// their head has arrived.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Timeout`] when the timeout elapses (never retried)
    /// - [`RelayError::Upstream`] for non-success statuses, with the body verbatim
    /// - [`RelayError::Http`] for transport failures
    pub async fn send(&self, request: &NormalizedRequest) -> Result<RelayResponse> {
        let timeout = self.config.timeout_for(request.has_documents);
        tracing::debug!(
            url = %self.config.url,
            timeout_secs = timeout.as_secs(),
            has_documents = request.has_documents,
            "Posting chat request to webhook"
        );

        let exchange = async {
            let mut builder = self.http.post(&self.config.url).json(&request.payload);
            for (name, value) in &self.config.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.send().await.map_err(RelayError::Http)?;
            self.classify(response).await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Webhook call timed out");
                Err(RelayError::Timeout {
                    seconds: timeout.as_secs(),
                }
                .into())
            }
        }
    }

    async fn classify(&self, response: Response) -> Result<RelayResponse> {
        let status = response.status();
        let header_execution_id = response
            .headers()
            .get(EXECUTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if self.is_inactive(&body) {
                tracing::warn!(status = status.as_u16(), "Workflow is not active, using fallback stream");
                return Ok(RelayResponse::Inactive { reason: body });
            }
            tracing::warn!(status = status.as_u16(), "Webhook returned an error status");
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("text/event-stream") {
            tracing::debug!(execution_id = ?header_execution_id, "Relaying streaming response");
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| anyhow::Error::from(RelayError::Http(e))));
            return Ok(RelayResponse::Streaming {
                body: Box::pin(body),
                execution_id: header_execution_id,
            });
        }

        let body = response.text().await.map_err(RelayError::Http)?;
        let mut parsed = parse_buffered(&body);
        if parsed.execution_id.is_none() {
            parsed.execution_id = header_execution_id;
        }
        tracing::debug!(
            chars = parsed.text.chars().count(),
            sources = parsed.sources.len(),
            "Received buffered response"
        );
        Ok(RelayResponse::Buffered(parsed))
    }

    fn is_inactive(&self, body: &str) -> bool {
        let body = body.to_lowercase();
        self.config
            .inactive_markers
            .iter()
            .any(|marker| body.contains(&marker.to_lowercase()))
    }
}

/// Parse a buffered webhook body
///
/// JSON objects (or the first element of a JSON array) contribute text,
/// sources, analytics and the execution id. Anything else is the answer
/// text itself.
pub fn parse_buffered(body: &str) -> BufferedResponse {
    let value = match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items.into_iter().next().unwrap_or(Value::Null),
        Ok(value) => value,
        Err(_) => {
            return BufferedResponse {
                text: body.to_string(),
                ..Default::default()
            }
        }
    };

    match value {
        Value::Object(map) => {
            let text = TEXT_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .map(str::to_string);
            if text.is_none() {
                tracing::warn!("Buffered response has no recognizable text field");
            }
            let sources = SOURCE_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_array))
                .cloned()
                .unwrap_or_default();
            let analytics = map.get("analytics").filter(|v| !v.is_null()).cloned();
            let execution_id = EXECUTION_ID_FIELDS
                .iter()
                .find_map(|field| map.get(*field))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
            BufferedResponse {
                text: text.unwrap_or_default(),
                sources,
                analytics,
                execution_id,
            }
        }
        Value::String(text) => BufferedResponse {
            text,
            ..Default::default()
        },
        Value::Null => BufferedResponse::default(),
        other => BufferedResponse {
            text: other.to_string(),
            ..Default::default()
        },
    }
}
