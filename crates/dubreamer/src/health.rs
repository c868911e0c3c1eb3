//! Per-stream status and the health derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{ErrorCategory, RelayError};

/// Lifecycle of one stream pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Draining,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Starting => write!(f, "starting"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Failed => 2,
        }
    }

    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a pipeline publishes about itself. Health is derived, never stored.
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    pub state: PipelineState,
    /// Last sequence number consumed from upstream.
    pub cursor: Option<u64>,
    pub window_len: usize,
    pub last_error: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
    /// A fetch is currently being retried.
    pub retrying: bool,
    /// The last completed cycle skipped a segment or hit a permanent error.
    pub last_cycle_degraded: bool,
    /// Retries were exhausted or permanent failures repeated; fetching stopped.
    pub failed: bool,
    /// Upstream ended and the playlist was closed.
    pub ended: bool,
    pub cycles: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub expected_interval: Option<Duration>,
}

impl StreamStatus {
    pub fn record_error(&mut self, err: &RelayError) {
        self.last_error = Some(err.to_string());
        self.last_error_category = Some(err.category());
    }

    pub fn health(&self) -> HealthStatus {
        self.health_at(Utc::now())
    }

    pub fn health_at(&self, now: DateTime<Utc>) -> HealthStatus {
        if self.failed {
            return HealthStatus::Failed;
        }
        if self.retrying || self.last_cycle_degraded {
            return HealthStatus::Degraded;
        }
        if self.state == PipelineState::Running
            && !self.ended
            && let (Some(last), Some(interval)) = (self.last_success, self.expected_interval)
            && let Ok(interval) = chrono::Duration::from_std(interval * 2)
            && now - last > interval
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamHealthReport {
    pub name: String,
    pub generation: u64,
    pub state: PipelineState,
    pub health: HealthStatus,
    pub cursor: Option<u64>,
    pub window_len: usize,
    pub last_error: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_success: Option<DateTime<Utc>>,
    pub ended: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub streams: Vec<StreamHealthReport>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(streams: Vec<StreamHealthReport>) -> Self {
        let status = streams
            .iter()
            .fold(HealthStatus::Healthy, |acc, s| acc.worst(s.health));
        Self {
            status,
            streams,
            generated_at: Utc::now(),
        }
    }

    pub fn stream(&self, name: &str) -> Option<&StreamHealthReport> {
        self.streams.iter().find(|s| s.name == name)
    }
}
