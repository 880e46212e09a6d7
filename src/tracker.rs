//! Execution progress tracking
//!
//! While a generation streams, the workflow engine's execution API is polled
//! for the execution id announced by the webhook. Each poll turns the number
//! of executed workflow steps into a coarse percentage and publishes it into
//! a `watch` cell that the emitter reads whenever it gets the chance.
//!
//! Tracking is best effort. When a poll fails the caller switches to
//! [`simulate_progress`], so the client never notices.

use crate::config::TrackerConfig;
use crate::error::{RelayError, Result};
use crate::stream::ProgressUpdate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Percent contributed by each executed workflow step
const PERCENT_PER_STEP: usize = 20;

/// Highest percent reported before the execution finishes
const MAX_RUNNING_PERCENT: u8 = 95;

/// Stages published when real progress is unavailable
pub const SIMULATED_STAGES: &[(&str, &str, u8)] = &[
    ("analyzing", "Analyzing your question", 15),
    ("searching", "Searching legal sources", 35),
    ("reviewing", "Reviewing relevant authorities", 60),
    ("composing", "Composing the answer", 80),
];

/// Sender half of the latest-progress cell
pub type ProgressSender = watch::Sender<Option<ProgressUpdate>>;

/// Receiver half of the latest-progress cell
pub type ProgressReceiver = watch::Receiver<Option<ProgressUpdate>>;

/// Create an empty latest-progress cell
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    watch::channel(None)
}

/// Lifecycle state of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    New,
    Running,
    Waiting,
    Success,
    Error,
    Canceled,
    Crashed,
    #[serde(other)]
    Unknown,
}

impl ExecutionState {
    /// Still worth polling: queued, running or waiting on a node
    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::Running | Self::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Canceled | Self::Crashed
        )
    }
}

/// Subset of the execution API response used for progress
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub status: ExecutionState,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub stopped_at: Option<String>,
    #[serde(default)]
    pub data: Option<ExecutionData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    #[serde(default)]
    pub result_data: Option<ResultData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultData {
    #[serde(default)]
    pub run_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub last_node_executed: Option<String>,
}

impl ExecutionSnapshot {
    fn result_data(&self) -> Option<&ResultData> {
        self.data.as_ref().and_then(|d| d.result_data.as_ref())
    }

    /// Number of distinct workflow steps that have run
    pub fn steps(&self) -> usize {
        self.result_data()
            .and_then(|r| r.run_data.as_ref())
            .map(Map::len)
            .unwrap_or(0)
    }

    pub fn last_node(&self) -> Option<&str> {
        self.result_data()
            .and_then(|r| r.last_node_executed.as_deref())
    }
}

/// Progress estimate for a snapshot
pub fn progress_for(snapshot: &ExecutionSnapshot) -> u8 {
    if snapshot.status.is_terminal() {
        return 100;
    }
    let percent = snapshot.steps().saturating_mul(PERCENT_PER_STEP);
    percent.min(MAX_RUNNING_PERCENT as usize) as u8
}

fn stage_for(snapshot: &ExecutionSnapshot) -> ProgressUpdate {
    let percent = progress_for(snapshot);
    let (stage, message) = match snapshot.status {
        ExecutionState::Success => ("complete", "Answer ready".to_string()),
        ExecutionState::Error | ExecutionState::Crashed => {
            ("failed", "Generation failed".to_string())
        }
        ExecutionState::Canceled => ("canceled", "Generation canceled".to_string()),
        _ => match snapshot.last_node() {
            Some(node) => ("running", format!("Running {}", node)),
            None => ("running", "Processing".to_string()),
        },
    };
    ProgressUpdate::new(stage, message, percent)
}

/// Polls the execution API for one execution at a time
#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    http: Client,
    api_base: String,
    api_key_header: String,
    api_key: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ExecutionTracker {
    /// Build a tracker, or `None` when tracking is disabled
    pub fn from_config(config: &TrackerConfig) -> Result<Option<Self>> {
        if !config.is_active() {
            return Ok(None);
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build tracker client: {}", e)))?;

        Ok(Some(Self {
            http,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key_header: config.api_key_header.clone(),
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_seconds),
        }))
    }

    /// Fetch the current snapshot of an execution
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Tracking`] for transport failures, non-success
    /// statuses and undecodable bodies.
    pub async fn poll(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        let url = format!("{}/executions/{}", self.api_base, execution_id);
        let mut request = self.http.get(&url).query(&[("includeData", "true")]);
        if let Some(key) = &self.api_key {
            request = request.header(self.api_key_header.as_str(), key.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Tracking(format!("status request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Tracking(format!(
                "status API returned HTTP {} for execution {}",
                status, execution_id
            ))
            .into());
        }

        response
            .json::<ExecutionSnapshot>()
            .await
            .map_err(|e| RelayError::Tracking(format!("invalid status response: {}", e)).into())
    }

    /// Poll until the execution leaves the running states, publishing
    /// progress on the way
    ///
    /// Published percentages never decrease, and 100 is published once, when
    /// a terminal state is observed. An unrecognised status stops polling
    /// without claiming completion.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Tracking`] on the first failed poll or when the
    /// tracking budget runs out. Polls are not retried.
    pub async fn track(
        &self,
        execution_id: &str,
        progress: &ProgressSender,
    ) -> Result<ExecutionState> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut published: Option<u8> = None;

        loop {
            let snapshot = self.poll(execution_id).await?;
            let mut update = stage_for(&snapshot);
            let percent = update.percent.unwrap_or(0).max(published.unwrap_or(0));

            if published.map_or(true, |last| percent > last) {
                update.percent = Some(percent);
                update.elapsed_ms = Some(start.elapsed().as_millis() as u64);
                tracing::debug!(execution_id, percent, stage = %update.stage, "Execution progress");
                progress.send_replace(Some(update));
                published = Some(percent);
            }

            if !snapshot.status.is_active() {
                tracing::debug!(execution_id, status = ?snapshot.status, "Execution left the running states");
                return Ok(snapshot.status);
            }

            if Instant::now() >= deadline {
                return Err(RelayError::Tracking(format!(
                    "execution {} still running after {}s",
                    execution_id,
                    self.timeout.as_secs()
                ))
                .into());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Publish [`SIMULATED_STAGES`] above the last published percent
pub async fn simulate_progress(progress: &ProgressSender, interval: Duration) {
    let start = Instant::now();
    for (stage, message, percent) in SIMULATED_STAGES {
        let last = progress
            .borrow()
            .as_ref()
            .and_then(|u| u.percent)
            .unwrap_or(0);
        if *percent <= last {
            continue;
        }
        let mut update = ProgressUpdate::new(*stage, *message, *percent);
        update.elapsed_ms = Some(start.elapsed().as_millis() as u64);
        progress.send_replace(Some(update));
        tokio::time::sleep(interval).await;
    }
}

/// Track an execution, falling back to simulated stages on failure
pub async fn track_or_simulate(
    tracker: ExecutionTracker,
    execution_id: String,
    progress: ProgressSender,
) {
    if let Err(e) = tracker.track(&execution_id, &progress).await {
        crate::metrics::record_tracker_failure();
        tracing::warn!(execution_id = %execution_id, error = %e, "Execution tracking failed, simulating progress");
        simulate_progress(&progress, tracker.poll_interval * 3).await;
    }
}
