//! Seams to the remote build server.
//!
//! The orchestrator and monitor only talk to these traits; [`TeamCityClient`]
//! is the REST implementation used by the CLI, and tests plug in fakes.

mod teamcity;

use async_trait::async_trait;
use log::debug;

use crate::build::{BuildState, BuildStatus, StatusDetail};
use crate::error::{BuildPilotError, Result};
use crate::queue::{BuildRequest, QueueEntry, QueuedBuild};

pub use teamcity::{TeamCityClient, DEFAULT_REQUEST_TIMEOUT};

/// Mutating queue operations. Everything except a 4xx response may be retried.
#[async_trait]
pub trait SubmissionProvider: Send + Sync {
    async fn add_build_to_queue(&self, request: &BuildRequest, move_to_top: bool) -> Result<QueuedBuild>;

    async fn cancel_queued_build(&self, build_id: &str, comment: Option<&str>) -> Result<()>;

    /// Places the given builds at the head of the queue, in this order.
    async fn set_queued_builds_order(&self, build_ids: &[String]) -> Result<()>;
}

/// Read-only view of the queue and of configuration capacity.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Live queue in order, head first.
    async fn list_queued_builds(&self) -> Result<Vec<QueueEntry>>;

    /// State of a build that may already have left the queue. `None` if unknown.
    async fn build_state(&self, build_id: &str) -> Result<Option<BuildState>>;

    /// `None` when the configuration allows unlimited concurrent builds.
    async fn max_concurrent_builds(&self, build_type_id: &str) -> Result<Option<u32>>;

    async fn running_build_count(&self, build_type_id: &str) -> Result<usize>;

    async fn queued_build_count(&self, build_type_id: &str) -> Result<usize>;

    async fn personal_build_count(&self, build_type_id: &str) -> Result<usize>;

    async fn compatible_agent_count(&self, build_type_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Primary status lookup. `None` when the server does not know the build (yet).
    async fn build_status(&self, build_id: &str, detail: StatusDetail) -> Result<Option<BuildStatus>>;

    /// Lookup in the queue listing, for builds not yet visible to the primary lookup.
    async fn queued_build(&self, build_id: &str) -> Result<Option<BuildStatus>>;

    /// Durations in seconds of recent successful builds of a configuration, newest first.
    async fn recent_durations(&self, _build_type_id: &str, _limit: usize) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// Looks a build up through the primary listing, then the queue, then the
/// primary listing once more.
///
/// The last step covers a build that left the queue between the first two
/// lookups.
pub async fn resolve_status(
    provider: &dyn StatusProvider,
    build_id: &str,
    detail: StatusDetail,
) -> Result<BuildStatus> {
    if let Some(status) = provider.build_status(build_id, detail).await? {
        return Ok(status);
    }

    debug!("Build {build_id} not in primary listing, checking queue");
    if let Some(status) = provider.queued_build(build_id).await? {
        return Ok(status);
    }

    debug!("Build {build_id} not queued either, retrying primary listing");
    provider
        .build_status(build_id, detail)
        .await?
        .ok_or_else(|| BuildPilotError::BuildNotFound(build_id.to_string()))
}
