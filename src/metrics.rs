//! Relay metrics
//!
//! Counters and histograms are emitted through the `metrics` facade. Nothing
//! is recorded until an exporter is installed (see
//! [`init_metrics_exporter`]), so the calls are free in tests.
//!
//! # Metrics
//!
//! - `chat_turns_total`: Counter of started turns by mode
//! - `chat_turn_duration_seconds`: Histogram of turn duration by outcome
//! - `chat_turn_completions_total`: Counter of finished turns by outcome
//! - `chat_turns_active`: Gauge of turns currently streaming
//! - `chat_fallback_total`: Counter of turns served by the fallback stream
//! - `chat_tracker_failures_total`: Counter of execution tracking failures
//! - `chat_persistence_retries_total`: Counter of retried store writes
//! - `chat_persistence_failures_total`: Counter of store writes that gave up
//! - `chat_response_anomalies_total`: Counter of suspicious answers by kind
//!
//! # Examples
//!
//! ```
//! use lawchat_relay::metrics::TurnMetrics;
//!
//! let metrics = TurnMetrics::new("stream");
//! metrics.record_outcome("completed");
//! ```

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Metrics of a single chat turn
///
/// Holds the active-turn gauge up for its lifetime. The outcome is recorded
/// once; dropping an unrecorded instance records `aborted`, which covers a
/// client that disconnected mid-stream.
#[derive(Debug)]
pub struct TurnMetrics {
    mode: &'static str,
    start: Instant,
    recorded: AtomicBool,
}

impl TurnMetrics {
    /// Start tracking a turn
    ///
    /// `mode` is the upstream response shape (`stream`, `buffered`, `fallback`).
    pub fn new(mode: &'static str) -> Self {
        increment_counter!("chat_turns_total", "mode" => mode);
        increment_gauge!("chat_turns_active", 1.0);

        Self {
            mode,
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Record how the turn ended (`completed`, `upstream_error`, ...)
    pub fn record_outcome(&self, outcome: &str) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        histogram!(
            "chat_turn_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "mode" => self.mode,
            "outcome" => outcome.to_string()
        );
        increment_counter!(
            "chat_turn_completions_total",
            "mode" => self.mode,
            "outcome" => outcome.to_string()
        );
        decrement_gauge!("chat_turns_active", 1.0);
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }
}

impl Drop for TurnMetrics {
    fn drop(&mut self) {
        if !self.is_recorded() {
            self.record_outcome("aborted");
        }
    }
}

/// A turn was served by the canned fallback stream
pub fn record_fallback(reason: &str) {
    increment_counter!("chat_fallback_total", "reason" => reason.to_string());
}

/// Execution tracking failed and progress fell back to simulated stages
pub fn record_tracker_failure() {
    increment_counter!("chat_tracker_failures_total");
}

/// A store write is about to be retried
pub fn record_persistence_retry(operation: &str) {
    increment_counter!("chat_persistence_retries_total", "operation" => operation.to_string());
}

/// A store write gave up
pub fn record_persistence_failure(operation: &str) {
    increment_counter!("chat_persistence_failures_total", "operation" => operation.to_string());
}

/// A finished answer looked damaged
pub fn record_anomaly(kind: &str) {
    increment_counter!("chat_response_anomalies_total", "kind" => kind.to_string());
}

/// Install the Prometheus exporter when the `prometheus` feature is enabled
///
/// Without the feature this is a no-op.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}
