use std::time::Duration;

use crate::build::StatusDetail;

/// Per-session settings of a [`BuildProgressMonitor`](super::BuildProgressMonitor).
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOptions {
    /// Pause between the end of one poll and the start of the next
    pub polling_interval: Duration,
    /// Derive progress velocity and a velocity-based ETA
    pub calculate_velocity: bool,
    /// Fall back to the average duration of recent successful builds when the
    /// server has no estimate
    pub use_historical_data: bool,
    pub track_stages: bool,
    /// Attach [`StageMetrics`](super::StageMetrics) to completed stages
    pub calculate_stage_metrics: bool,
    pub include_tests: bool,
    pub include_problems: bool,
    /// How long progress may stay flat before the build is reported stalled
    pub stall_threshold: Duration,
    /// Consecutive failed polls before the session gives up
    pub max_retries: u32,
    /// Hard limit on the session's lifetime
    pub max_duration: Option<Duration>,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(5000),
            calculate_velocity: true,
            use_historical_data: false,
            track_stages: true,
            calculate_stage_metrics: false,
            include_tests: false,
            include_problems: false,
            stall_threshold: Duration::from_millis(30_000),
            max_retries: 3,
            max_duration: None,
        }
    }
}

impl TrackingOptions {
    pub fn status_detail(&self) -> StatusDetail {
        StatusDetail {
            include_tests: self.include_tests,
            include_problems: self.include_problems,
        }
    }
}
