use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build::{BuildState, BuildStatus, TestCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Manual,
    MaxRetriesExceeded,
    MaxDurationExceeded,
}

/// Payload of every [`BuildEvent::Progress`], derived from one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub build_id: String,
    pub state: BuildState,
    pub percentage_complete: f64,
    pub current_stage: Option<String>,
    pub status_text: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub estimated_total_seconds: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    /// Percent per second, measured between the last two increases
    pub velocity: Option<f64>,
    pub overdue: bool,
    pub overdue_seconds: Option<f64>,
    pub queue_position: Option<u32>,
    pub tests: Option<TestCounts>,
    pub problems: Option<Vec<String>>,
    pub poll_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub duration_seconds: f64,
    pub progress_delta: f64,
    /// Percent per second over the stage
    pub progress_rate: Option<f64>,
}

/// Everything a tracking session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BuildEvent {
    Queued {
        build_id: String,
        queue_position: Option<u32>,
        wait_reason: Option<String>,
    },
    Started {
        build_id: String,
        web_url: Option<String>,
    },
    Progress(ProgressUpdate),
    Stalled {
        build_id: String,
        percentage_complete: f64,
        stalled_for_seconds: f64,
    },
    StageChanged {
        build_id: String,
        previous: Option<String>,
        stage: String,
    },
    StageCompleted {
        build_id: String,
        stage: String,
        metrics: Option<StageMetrics>,
    },
    Completed {
        build_id: String,
        status: BuildStatus,
    },
    Failed {
        build_id: String,
        status: BuildStatus,
    },
    Canceled {
        build_id: String,
        status: BuildStatus,
    },
    Stopped {
        build_id: String,
        reason: StopReason,
    },
    Error {
        build_id: String,
        message: String,
        error_count: u32,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> &str {
        match self {
            Self::Progress(update) => &update.build_id,
            Self::Queued { build_id, .. }
            | Self::Started { build_id, .. }
            | Self::Stalled { build_id, .. }
            | Self::StageChanged { build_id, .. }
            | Self::StageCompleted { build_id, .. }
            | Self::Completed { build_id, .. }
            | Self::Failed { build_id, .. }
            | Self::Canceled { build_id, .. }
            | Self::Stopped { build_id, .. }
            | Self::Error { build_id, .. } => build_id,
        }
    }

    /// Whether no further events follow this one in its session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Canceled { .. } | Self::Stopped { .. }
        )
    }
}
