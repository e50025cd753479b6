use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the build server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    #[default]
    Queued,
    Running,
    Finished,
}

impl BuildState {
    /// Lenient parse of the server's state string. Unknown values map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Which optional sections a status lookup should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusDetail {
    pub include_tests: bool,
    pub include_problems: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub ignored: u32,
    pub muted: u32,
}

/// Normalized status snapshot of one build.
///
/// Built once at the provider boundary; everything downstream reads these
/// fields instead of the raw server payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildStatus {
    pub build_id: String,
    pub build_type_id: String,
    pub state: BuildState,
    /// `SUCCESS`, `FAILURE` or `UNKNOWN` once the server has an opinion
    pub status: Option<String>,
    pub status_text: Option<String>,
    pub canceled: bool,
    pub percentage_complete: Option<f64>,
    pub current_stage_text: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub estimated_total_seconds: Option<f64>,
    pub queue_position: Option<u32>,
    pub wait_reason: Option<String>,
    pub web_url: Option<String>,
    pub branch_name: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub tests: Option<TestCounts>,
    pub problems: Option<Vec<String>>,
}

impl BuildStatus {
    pub fn is_finished(&self) -> bool {
        !self.state.is_active()
    }

    pub fn is_successful(&self) -> bool {
        self.is_finished()
            && !self.canceled
            && self
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("success"))
    }
}
