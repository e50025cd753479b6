use serde::Serialize;

use super::types::{QueuePosition, QueuedBuild};

/// One failed request of a [`queue_builds`](super::BuildQueueOrchestrator::queue_builds) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    /// Index of the request in the submitted slice
    pub index: usize,
    pub build_type_id: String,
    pub message: String,
}

/// Notifications published by the orchestrator to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    Queued { build: QueuedBuild },
    Error { build_type_id: String, message: String },
    #[serde(rename = "batch:partial")]
    BatchPartial {
        succeeded: usize,
        failures: Vec<BatchFailure>,
    },
    MovedToTop { position: QueuePosition },
    Reordered { positions: Vec<QueuePosition> },
    Canceled { build_id: String },
}
