//! Configuration management for the chat relay
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, RelayError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the relay
///
/// Holds the settings for the HTTP server, the generation backend, the
/// execution tracker, the client stream, persistence and request limits.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Generation backend (webhook) settings
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Execution status polling settings
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Client stream pacing and save throttling
    #[serde(default)]
    pub stream: StreamConfig,
    /// Persistence store settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Request size and shape limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL receiving chat requests
    #[serde(default = "default_webhook_url")]
    pub url: String,

    /// Extra headers sent with every webhook call (e.g. Authorization)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Timeout for requests without document context (seconds)
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,

    /// Timeout for requests carrying document context (seconds)
    #[serde(default = "default_document_timeout")]
    pub document_timeout_seconds: u64,

    /// Body fragments identifying an inactive workflow
    #[serde(default = "default_inactive_markers")]
    pub inactive_markers: Vec<String>,
}

fn default_webhook_url() -> String {
    "http://localhost:5678/webhook/lawyer-chat".to_string()
}

fn default_webhook_timeout() -> u64 {
    120
}

fn default_document_timeout() -> u64 {
    300
}

fn default_inactive_markers() -> Vec<String> {
    vec![
        "workflow must be active".to_string(),
        "is not registered".to_string(),
    ]
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: default_webhook_url(),
            headers: HashMap::new(),
            timeout_seconds: default_webhook_timeout(),
            document_timeout_seconds: default_document_timeout(),
            inactive_markers: default_inactive_markers(),
        }
    }
}

impl WebhookConfig {
    /// Timeout applied to a webhook call
    ///
    /// Document-augmented prompts get the longer budget.
    pub fn timeout_for(&self, has_documents: bool) -> Duration {
        if has_documents {
            Duration::from_secs(self.document_timeout_seconds)
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }
}

/// Execution status tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Whether execution progress is polled at all
    #[serde(default = "default_tracker_enabled")]
    pub enabled: bool,

    /// Base URL of the execution status API (e.g. `http://localhost:5678/api/v1`)
    #[serde(default)]
    pub api_base: Option<String>,

    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// API key value
    #[serde(default)]
    pub api_key: Option<String>,

    /// Delay between polls (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Overall tracking budget (seconds)
    #[serde(default = "default_tracker_timeout")]
    pub timeout_seconds: u64,
}

fn default_tracker_enabled() -> bool {
    true
}

fn default_api_key_header() -> String {
    "X-N8N-API-KEY".to_string()
}

fn default_poll_interval() -> u64 {
    500
}

fn default_tracker_timeout() -> u64 {
    300
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: default_tracker_enabled(),
            api_base: None,
            api_key_header: default_api_key_header(),
            api_key: None,
            poll_interval_ms: default_poll_interval(),
            timeout_seconds: default_tracker_timeout(),
        }
    }
}

impl TrackerConfig {
    /// Tracking is possible only when enabled and pointed at an API
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_base.as_deref().is_some_and(|b| !b.is_empty())
    }
}

/// Client stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Characters per emitted text chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay between emitted text chunks (milliseconds)
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_ms: u64,

    /// Minimum spacing between mid-stream saves (milliseconds)
    #[serde(default = "default_save_interval")]
    pub save_interval_ms: u64,
}

fn default_chunk_size() -> usize {
    2
}

fn default_chunk_delay() -> u64 {
    20
}

fn default_save_interval() -> u64 {
    2_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay(),
            save_interval_ms: default_save_interval(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file; the platform data directory is used when unset
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Maximum attempts per write, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for the backoff delay (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    2_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message length (characters)
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Maximum number of tools per request
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,

    /// Maximum bytes kept from each context document
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

fn default_max_message_length() -> usize {
    10_000
}

fn default_max_tools() -> usize {
    5
}

fn default_max_document_bytes() -> usize {
    10 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            max_tools: default_max_tools(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON formatted logs
    #[serde(default)]
    pub json: bool,

    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "lawchat_relay=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(bind) = std::env::var("LAWCHAT_BIND") {
            self.server.bind = bind;
        }

        if let Ok(url) = std::env::var("LAWCHAT_WEBHOOK_URL") {
            self.webhook.url = url;
        }

        if let Ok(auth) = std::env::var("LAWCHAT_WEBHOOK_AUTH") {
            self.webhook
                .headers
                .insert("Authorization".to_string(), auth);
        }

        if let Ok(timeout) = std::env::var("LAWCHAT_WEBHOOK_TIMEOUT_SECONDS") {
            match timeout.parse() {
                Ok(value) => self.webhook.timeout_seconds = value,
                Err(_) => tracing::warn!("Invalid LAWCHAT_WEBHOOK_TIMEOUT_SECONDS: {}", timeout),
            }
        }

        if let Ok(timeout) = std::env::var("LAWCHAT_WEBHOOK_DOCUMENT_TIMEOUT_SECONDS") {
            match timeout.parse() {
                Ok(value) => self.webhook.document_timeout_seconds = value,
                Err(_) => tracing::warn!(
                    "Invalid LAWCHAT_WEBHOOK_DOCUMENT_TIMEOUT_SECONDS: {}",
                    timeout
                ),
            }
        }

        if let Ok(api_base) = std::env::var("LAWCHAT_TRACKER_API_BASE") {
            self.tracker.api_base = Some(api_base);
        }

        if let Ok(api_key) = std::env::var("LAWCHAT_TRACKER_API_KEY") {
            self.tracker.api_key = Some(api_key);
        }

        if let Ok(enabled) = std::env::var("LAWCHAT_TRACKER_ENABLED") {
            match enabled.parse::<bool>() {
                Ok(v) => {
                    self.tracker.enabled = v;
                    tracing::debug!(enabled = v, "Env override: LAWCHAT_TRACKER_ENABLED");
                }
                Err(_) => tracing::warn!("Invalid value for LAWCHAT_TRACKER_ENABLED: {}", enabled),
            }
        }

        if let Ok(db_path) = std::env::var("LAWCHAT_DB_PATH") {
            self.persistence.db_path = Some(PathBuf::from(db_path));
        }

        if let Ok(delay) = std::env::var("LAWCHAT_CHUNK_DELAY_MS") {
            match delay.parse() {
                Ok(value) => self.stream.chunk_delay_ms = value,
                Err(_) => tracing::warn!("Invalid LAWCHAT_CHUNK_DELAY_MS: {}", delay),
            }
        }

        if let Ok(json_logs) = std::env::var("LAWCHAT_JSON_LOGS") {
            match json_logs.parse::<bool>() {
                Ok(v) => self.logging.json = v,
                Err(_) => tracing::warn!("Invalid value for LAWCHAT_JSON_LOGS: {}", json_logs),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
        if cli.json_logs {
            self.logging.json = true;
        }
        if let Some(db_path) = &cli.db_path {
            self.persistence.db_path = Some(PathBuf::from(db_path));
        }
        if let crate::cli::Commands::Serve {
            bind: Some(bind), ..
        } = &cli.command
        {
            self.server.bind = bind.clone();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.webhook.url.trim().is_empty() {
            return Err(RelayError::Config("webhook.url cannot be empty".to_string()).into());
        }
        url::Url::parse(&self.webhook.url)
            .map_err(|e| RelayError::Config(format!("webhook.url is not a valid URL: {}", e)))?;

        if self.webhook.timeout_seconds == 0 || self.webhook.document_timeout_seconds == 0 {
            return Err(
                RelayError::Config("webhook timeouts must be greater than 0".to_string()).into(),
            );
        }
        if self.webhook.timeout_seconds > self.webhook.document_timeout_seconds {
            return Err(RelayError::Config(
                "webhook.timeout_seconds cannot exceed webhook.document_timeout_seconds"
                    .to_string(),
            )
            .into());
        }

        if let Some(api_base) = &self.tracker.api_base {
            url::Url::parse(api_base).map_err(|e| {
                RelayError::Config(format!("tracker.api_base is not a valid URL: {}", e))
            })?;
        }
        if self.tracker.poll_interval_ms == 0 {
            return Err(RelayError::Config(
                "tracker.poll_interval_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.stream.chunk_size == 0 {
            return Err(
                RelayError::Config("stream.chunk_size must be greater than 0".to_string()).into(),
            );
        }

        if self.persistence.max_attempts == 0 {
            return Err(RelayError::Config(
                "persistence.max_attempts must be greater than 0".to_string(),
            )
            .into());
        }
        if self.persistence.max_delay_ms < self.persistence.initial_delay_ms {
            return Err(RelayError::Config(
                "persistence.max_delay_ms cannot be lower than persistence.initial_delay_ms"
                    .to_string(),
            )
            .into());
        }

        if self.limits.max_message_length == 0 || self.limits.max_document_bytes == 0 {
            return Err(RelayError::Config("limits must be greater than 0".to_string()).into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.webhook.timeout_seconds, 120);
        assert_eq!(config.webhook.document_timeout_seconds, 300);
        assert_eq!(config.tracker.poll_interval_ms, 500);
        assert_eq!(config.stream.save_interval_ms, 2_000);
        assert_eq!(config.persistence.max_attempts, 3);
        assert_eq!(config.limits.max_tools, 5);
        assert_eq!(config.limits.max_document_bytes, 10_240);
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_url() {
        let mut config = Config::default();
        config.webhook.url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_short_timeout_exceeds_long() {
        let mut config = Config::default();
        config.webhook.timeout_seconds = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_chunk_size() {
        let mut config = Config::default();
        config.stream.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_backoff_bounds() {
        let mut config = Config::default();
        config.persistence.initial_delay_ms = 5_000;
        config.persistence.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_for_documents() {
        let webhook = WebhookConfig::default();
        assert_eq!(webhook.timeout_for(false), Duration::from_secs(120));
        assert_eq!(webhook.timeout_for(true), Duration::from_secs(300));
    }

    #[test]
    fn test_tracker_inactive_without_api_base() {
        let tracker = TrackerConfig::default();
        assert!(!tracker.is_active());

        let tracker = TrackerConfig {
            api_base: Some("http://localhost:5678/api/v1".to_string()),
            ..TrackerConfig::default()
        };
        assert!(tracker.is_active());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
webhook:
  url: http://n8n:5678/webhook/chat
  timeout_seconds: 60
  headers:
    Authorization: Bearer abc
tracker:
  api_base: http://n8n:5678/api/v1
  api_key: secret
stream:
  chunk_size: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(config.webhook.url, "http://n8n:5678/webhook/chat");
        assert_eq!(config.webhook.timeout_seconds, 60);
        assert_eq!(config.webhook.document_timeout_seconds, 300);
        assert_eq!(
            config.webhook.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert_eq!(config.tracker.api_key.as_deref(), Some("secret"));
        assert_eq!(config.stream.chunk_size, 1);
        assert_eq!(config.stream.chunk_delay_ms, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        let cli = crate::cli::Cli::default();
        let config = Config::load("/nonexistent/lawchat.yaml", &cli).expect("load");
        assert_eq!(config.webhook.timeout_seconds, 120);
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_overrides() {
        std::env::set_var("LAWCHAT_WEBHOOK_URL", "http://example.test/hook");
        std::env::set_var("LAWCHAT_WEBHOOK_TIMEOUT_SECONDS", "not-a-number");
        std::env::set_var("LAWCHAT_TRACKER_ENABLED", "false");

        let mut config = Config::default();
        config.apply_env_vars();

        assert_eq!(config.webhook.url, "http://example.test/hook");
        assert_eq!(config.webhook.timeout_seconds, 120);
        assert!(!config.tracker.enabled);

        std::env::remove_var("LAWCHAT_WEBHOOK_URL");
        std::env::remove_var("LAWCHAT_WEBHOOK_TIMEOUT_SECONDS");
        std::env::remove_var("LAWCHAT_TRACKER_ENABLED");
    }

    #[test]
    fn test_cli_overrides_bind_and_db_path() {
        let cli = crate::cli::Cli {
            config: None,
            verbose: false,
            json_logs: true,
            db_path: Some("/tmp/lawchat.db".to_string()),
            command: crate::cli::Commands::Serve {
                bind: Some("0.0.0.0:9000".to_string()),
            },
        };
        let mut config = Config::default();
        config.apply_cli_overrides(&cli);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(config.logging.json);
        assert_eq!(
            config.persistence.db_path,
            Some(PathBuf::from("/tmp/lawchat.db"))
        );
    }
}
