use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A build the caller wants placed on the queue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_type_id: String,
    pub branch_name: Option<String>,
    /// Build parameters, sent in insertion order
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
    /// Snapshot dependencies on builds that already exist
    #[serde(default)]
    pub dependencies: Vec<SnapshotDependency>,
    #[serde(default)]
    pub personal: bool,
    #[serde(default)]
    pub move_to_top: bool,
    pub comment: Option<String>,
}

impl BuildRequest {
    pub fn new(build_type_id: impl Into<String>) -> Self {
        Self {
            build_type_id: build_type_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, build_id: impl Into<String>) -> Self {
        self.dependencies.push(SnapshotDependency {
            build_id: build_id.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDependency {
    pub build_id: String,
}

/// Snapshot of a build taken right after the server accepted it.
///
/// Never updated in place; later polls produce new snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedBuild {
    pub build_id: String,
    pub build_type_id: String,
    pub branch_name: Option<String>,
    pub queue_position: u32,
    pub queued_date: DateTime<Utc>,
    pub estimated_start_time: Option<DateTime<Utc>>,
    /// Seconds
    pub estimated_duration: Option<f64>,
    pub web_url: String,
    pub personal: bool,
    pub triggered_by: String,
    pub parameters: IndexMap<String, String>,
}

/// One build in the server's live queue, in queue order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub build_id: String,
    pub build_type_id: String,
    pub queued_date: Option<DateTime<Utc>>,
    pub estimated_start_time: Option<DateTime<Utc>>,
    pub wait_reason: Option<String>,
    /// Ids of the builds this one has snapshot dependencies on
    pub snapshot_dependencies: Vec<String>,
}

/// Where a build currently sits in the queue. Computed on demand, never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub build_id: String,
    /// 1-based among queued builds; 0 once the build has left the queue
    pub position: u32,
    pub estimated_start_time: Option<DateTime<Utc>>,
    /// Seconds
    pub estimated_wait_time: Option<f64>,
    pub can_move_to_top: bool,
    pub blocked_by: Vec<String>,
}

impl QueuePosition {
    pub(crate) fn left_queue(build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            position: 0,
            estimated_start_time: None,
            estimated_wait_time: None,
            can_move_to_top: false,
            blocked_by: Vec::new(),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.position > 0
    }
}

/// Capacity telemetry for one build configuration.
///
/// Assembled from independent reads, so the numbers can be mutually skewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLimitations {
    pub build_type_id: String,
    /// `None` when the configuration has no limit
    pub max_concurrent_builds: Option<u32>,
    pub currently_running: usize,
    pub queued_builds: usize,
    pub available_agents: usize,
    pub personal_builds_queued: usize,
}

impl QueueLimitations {
    /// Values used when telemetry cannot be fetched; they never block a submission.
    pub fn conservative(build_type_id: &str) -> Self {
        Self {
            build_type_id: build_type_id.to_string(),
            max_concurrent_builds: None,
            currently_running: 0,
            queued_builds: 0,
            available_agents: 1,
            personal_builds_queued: 0,
        }
    }

    pub fn concurrency_reached(&self) -> bool {
        self.max_concurrent_builds
            .is_some_and(|max| self.currently_running >= max as usize)
    }
}
