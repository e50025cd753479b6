//! Build submission and queue management.

mod events;
mod orchestrator;
mod types;

pub use events::{BatchFailure, QueueEvent};
pub use orchestrator::{BuildQueueOrchestrator, OrchestratorConfig};
pub use types::{
    BuildRequest, QueueEntry, QueueLimitations, QueuePosition, QueuedBuild, SnapshotDependency,
};
