use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use super::events::{BatchFailure, QueueEvent};
use super::types::{BuildRequest, QueueEntry, QueueLimitations, QueuePosition, QueuedBuild};
use crate::concurrency::{parallel_limit, DEFAULT_CONCURRENCY};
use crate::error::{BuildPilotError, Result};
use crate::providers::{QueueProvider, SubmissionProvider};
use crate::resilience::{CircuitBreakerManager, RetryExecutor, RetryPolicy};

const SUBMIT_ENDPOINT: &str = "buildQueue";
const ORDER_ENDPOINT: &str = "buildQueue/order";
const QUEUE_READ_ENDPOINT: &str = "buildQueue/snapshot";
const BUILDS_ENDPOINT: &str = "builds";
const BUILD_TYPES_ENDPOINT: &str = "buildTypes";
const AGENTS_ENDPOINT: &str = "agents";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Submissions in flight during `queue_builds`
    pub batch_concurrency: usize,
    /// Queued personal builds per configuration before personal submissions are refused
    pub max_personal_builds: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: DEFAULT_CONCURRENCY,
            max_personal_builds: None,
        }
    }
}

/// Submits builds and manipulates the server's queue.
///
/// Submissions and cancellations retry around the circuit breaker, so every
/// attempt counts against the endpoint and an open circuit stops the retry
/// loop. Reordering puts the breaker around the retry, so one reorder counts
/// once. Reads go through their endpoint's breaker without retrying.
pub struct BuildQueueOrchestrator {
    submission: Arc<dyn SubmissionProvider>,
    queue: Arc<dyn QueueProvider>,
    breakers: Arc<CircuitBreakerManager>,
    retry_policy: RetryPolicy,
    config: OrchestratorConfig,
    events: broadcast::Sender<QueueEvent>,
}

impl BuildQueueOrchestrator {
    pub fn new(
        submission: Arc<dyn SubmissionProvider>,
        queue: Arc<dyn QueueProvider>,
        breakers: Arc<CircuitBreakerManager>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            submission,
            queue,
            breakers,
            retry_policy,
            config: OrchestratorConfig::default(),
            events,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    fn emit(&self, event: QueueEvent) {
        // Having no subscriber is fine
        let _ = self.events.send(event);
    }

    fn retry(&self) -> RetryExecutor<BuildPilotError> {
        RetryExecutor::new(self.retry_policy).should_retry(|err: &BuildPilotError, _| err.is_retryable())
    }

    /// Validates, checks capacity, submits and optionally moves the build to the head of the queue.
    pub async fn queue_build(&self, request: &BuildRequest) -> Result<QueuedBuild> {
        match self.submit(request).await {
            Ok(build) => {
                self.emit(QueueEvent::Queued {
                    build: build.clone(),
                });
                Ok(build)
            }
            Err(err) => {
                self.emit(QueueEvent::Error {
                    build_type_id: request.build_type_id.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn submit(&self, request: &BuildRequest) -> Result<QueuedBuild> {
        validate_request(request)?;

        let limitations = self.get_queue_limitations(&request.build_type_id).await;
        self.check_capacity(request, &limitations)?;

        let retry = self.retry();
        let queued = retry
            .run(move || {
                self.breakers.execute(SUBMIT_ENDPOINT, move || {
                    self.submission.add_build_to_queue(request, false)
                })
            })
            .await?;
        info!(
            "Queued build {} for {} at position {}",
            queued.build_id, queued.build_type_id, queued.queue_position
        );

        if !request.move_to_top {
            return Ok(queued);
        }

        match self.move_to_top(&queued.build_id).await {
            Ok(position) => Ok(QueuedBuild {
                queue_position: position.position,
                estimated_start_time: position.estimated_start_time.or(queued.estimated_start_time),
                ..queued
            }),
            Err(err) => {
                warn!("Build {} was queued but could not be moved to the top: {err}", queued.build_id);
                Ok(queued)
            }
        }
    }

    fn check_capacity(&self, request: &BuildRequest, limitations: &QueueLimitations) -> Result<()> {
        if let (true, Some(max)) = (limitations.concurrency_reached(), limitations.max_concurrent_builds) {
            return Err(BuildPilotError::CapacityExceeded {
                build_type_id: request.build_type_id.clone(),
                reason: format!(
                    "{} of {max} concurrent builds already running",
                    limitations.currently_running
                ),
            });
        }

        if request.personal {
            if let Some(max) = self.config.max_personal_builds {
                if limitations.personal_builds_queued >= max {
                    return Err(BuildPilotError::CapacityExceeded {
                        build_type_id: request.build_type_id.clone(),
                        reason: format!(
                            "{} of {max} personal builds already queued",
                            limitations.personal_builds_queued
                        ),
                    });
                }
            }
        }

        if limitations.available_agents == 0 {
            warn!(
                "No compatible agents available for {}, build will wait in the queue",
                request.build_type_id
            );
        }

        Ok(())
    }

    /// Submits every request with bounded concurrency and returns the builds that were queued.
    ///
    /// Failures do not fail the call. They are logged and published as one
    /// [`QueueEvent::BatchPartial`].
    pub async fn queue_builds(&self, requests: &[BuildRequest]) -> Vec<QueuedBuild> {
        let outcomes = parallel_limit(
            requests.iter().enumerate(),
            self.config.batch_concurrency,
            |(index, request)| async move {
                Ok::<_, Infallible>((index, request, self.queue_build(request).await))
            },
        )
        .await
        .unwrap_or_else(|never| match never {});

        let mut queued = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (index, request, outcome) in outcomes {
            match outcome {
                Ok(build) => queued.push(build),
                Err(err) => failures.push(BatchFailure {
                    index,
                    build_type_id: request.build_type_id.clone(),
                    message: err.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            warn!(
                "{} of {} build submissions failed",
                failures.len(),
                requests.len()
            );
            self.emit(QueueEvent::BatchPartial {
                succeeded: queued.len(),
                failures,
            });
        }

        queued
    }

    /// Current position of a build.
    ///
    /// A build that is no longer queued but known to the server is reported at
    /// position 0. [`BuildPilotError::NotFoundInQueue`] is returned only when
    /// the server does not know the build at all.
    pub async fn get_queue_position(&self, build_id: &str) -> Result<QueuePosition> {
        let entries = self.queue_snapshot().await?;
        self.locate(&entries, build_id).await
    }

    async fn queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        self.breakers
            .execute(QUEUE_READ_ENDPOINT, || self.queue.list_queued_builds())
            .await
    }

    async fn locate(&self, entries: &[QueueEntry], build_id: &str) -> Result<QueuePosition> {
        if let Some(position) = position_in(entries, build_id) {
            return Ok(position);
        }

        let state = self
            .breakers
            .execute(BUILDS_ENDPOINT, || self.queue.build_state(build_id))
            .await?;
        match state {
            Some(state) => {
                debug!("Build {build_id} has left the queue ({state:?})");
                Ok(QueuePosition::left_queue(build_id))
            }
            None => Err(BuildPilotError::NotFoundInQueue(build_id.to_string())),
        }
    }

    async fn positions_for(&self, build_ids: &[String]) -> Result<Vec<QueuePosition>> {
        let entries = self.queue_snapshot().await?;
        let mut positions = Vec::with_capacity(build_ids.len());
        for build_id in build_ids {
            positions.push(self.locate(&entries, build_id).await?);
        }
        Ok(positions)
    }

    async fn apply_order(&self, build_ids: &[String]) -> Result<()> {
        let retry = self.retry();
        self.breakers
            .execute(ORDER_ENDPOINT, || {
                retry.run(move || self.submission.set_queued_builds_order(build_ids))
            })
            .await
    }

    /// Moves a queued build to the head of the queue and returns its new position.
    ///
    /// Builds already at the head, or no longer queued, are returned unchanged.
    pub async fn move_to_top(&self, build_id: &str) -> Result<QueuePosition> {
        let current = self.get_queue_position(build_id).await?;
        if current.position <= 1 {
            return Ok(current);
        }
        if !current.blocked_by.is_empty() {
            return Err(BuildPilotError::Blocked {
                build_id: build_id.to_string(),
                blocked_by: current.blocked_by,
            });
        }

        self.apply_order(&[build_id.to_string()]).await?;
        let updated = self.get_queue_position(build_id).await?;
        info!(
            "Moved build {build_id} from position {} to {}",
            current.position, updated.position
        );

        self.emit(QueueEvent::MovedToTop {
            position: updated.clone(),
        });
        Ok(updated)
    }

    /// Places the given builds at the head of the queue in the given order.
    ///
    /// Nothing is changed if any of them is blocked or no longer queued.
    pub async fn reorder_queue(&self, build_ids: &[String]) -> Result<Vec<QueuePosition>> {
        validate_order(build_ids)?;

        let current = self.positions_for(build_ids).await?;
        for position in &current {
            if !position.is_queued() {
                return Err(BuildPilotError::NotFoundInQueue(position.build_id.clone()));
            }
            if !position.blocked_by.is_empty() {
                return Err(BuildPilotError::Blocked {
                    build_id: position.build_id.clone(),
                    blocked_by: position.blocked_by.clone(),
                });
            }
        }

        self.apply_order(build_ids).await?;
        let updated = self.positions_for(build_ids).await?;
        info!("Reordered {} queued builds", updated.len());

        self.emit(QueueEvent::Reordered {
            positions: updated.clone(),
        });
        Ok(updated)
    }

    /// Capacity telemetry for a configuration. Never fails: if any read fails
    /// the conservative defaults are returned.
    pub async fn get_queue_limitations(&self, build_type_id: &str) -> QueueLimitations {
        match self.fetch_limitations(build_type_id).await {
            Ok(limitations) => limitations,
            Err(err) => {
                warn!("Could not fetch queue limitations for {build_type_id}, assuming defaults: {err}");
                QueueLimitations::conservative(build_type_id)
            }
        }
    }

    async fn fetch_limitations(&self, build_type_id: &str) -> Result<QueueLimitations> {
        let queue = &self.queue;
        let (max_concurrent_builds, currently_running, queued_builds, personal_builds_queued, available_agents) =
            tokio::try_join!(
                self.breakers
                    .execute(BUILD_TYPES_ENDPOINT, || queue.max_concurrent_builds(build_type_id)),
                self.breakers
                    .execute(BUILDS_ENDPOINT, || queue.running_build_count(build_type_id)),
                self.breakers
                    .execute(QUEUE_READ_ENDPOINT, || queue.queued_build_count(build_type_id)),
                self.breakers
                    .execute(QUEUE_READ_ENDPOINT, || queue.personal_build_count(build_type_id)),
                self.breakers
                    .execute(AGENTS_ENDPOINT, || queue.compatible_agent_count(build_type_id)),
            )?;

        Ok(QueueLimitations {
            build_type_id: build_type_id.to_string(),
            max_concurrent_builds,
            currently_running,
            queued_builds,
            available_agents,
            personal_builds_queued,
        })
    }

    pub async fn cancel_queued_build(&self, build_id: &str, comment: Option<&str>) -> Result<()> {
        let retry = self.retry();
        retry
            .run(move || {
                self.breakers.execute(SUBMIT_ENDPOINT, move || {
                    self.submission.cancel_queued_build(build_id, comment)
                })
            })
            .await?;
        info!("Canceled queued build {build_id}");

        self.emit(QueueEvent::Canceled {
            build_id: build_id.to_string(),
        });
        Ok(())
    }
}

/// Rejects requests that must never reach the server.
///
/// Only duplicate ids within the request's own dependency list are detected;
/// dependency chains through builds already in the queue are not walked.
fn validate_request(request: &BuildRequest) -> Result<()> {
    if request.build_type_id.trim().is_empty() {
        return Err(BuildPilotError::Validation(
            "Build configuration id must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for dependency in &request.dependencies {
        if dependency.build_id.trim().is_empty() {
            return Err(BuildPilotError::Validation(
                "Dependency build id must not be empty".to_string(),
            ));
        }
        if !seen.insert(dependency.build_id.as_str()) {
            return Err(BuildPilotError::Validation(format!(
                "Duplicate dependency on build {}",
                dependency.build_id
            )));
        }
    }

    Ok(())
}

fn validate_order(build_ids: &[String]) -> Result<()> {
    if build_ids.is_empty() {
        return Err(BuildPilotError::Validation(
            "At least one build id is required to reorder the queue".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = build_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(BuildPilotError::Validation(format!(
            "Build {duplicate} appears more than once in the requested order"
        )));
    }

    Ok(())
}

fn position_in(entries: &[QueueEntry], build_id: &str) -> Option<QueuePosition> {
    let index = entries.iter().position(|e| e.build_id == build_id)?;
    let entry = &entries[index];

    let queued: HashSet<&str> = entries.iter().map(|e| e.build_id.as_str()).collect();
    let blocked_by: Vec<String> = entry
        .snapshot_dependencies
        .iter()
        .filter(|dep| queued.contains(dep.as_str()))
        .cloned()
        .collect();

    let position = index as u32 + 1;
    let estimated_wait_time = entry
        .estimated_start_time
        .map(|start| ((start - Utc::now()).num_milliseconds() as f64 / 1000.0).max(0.0));

    Some(QueuePosition {
        build_id: build_id.to_string(),
        position,
        estimated_start_time: entry.estimated_start_time,
        estimated_wait_time,
        can_move_to_top: position > 1 && blocked_by.is_empty(),
        blocked_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildState;
    use crate::resilience::CircuitBreakerConfig;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    /// In-memory queue that records every call made against it.
    #[derive(Default)]
    struct FakeServer {
        queue: Mutex<Vec<QueueEntry>>,
        states: HashMap<String, BuildState>,
        max_concurrent: Option<u32>,
        running: usize,
        personal_queued: usize,
        agents: usize,
        telemetry_down: bool,
        rejected_types: HashSet<String>,
        submit_failures: Mutex<VecDeque<BuildPilotError>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn with_queue(entries: Vec<QueueEntry>) -> Self {
            Self {
                queue: Mutex::new(entries),
                agents: 2,
                ..Self::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count_calls(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn queue_ids(&self) -> Vec<String> {
            self.queue.lock().unwrap().iter().map(|e| e.build_id.clone()).collect()
        }

        fn telemetry<T>(&self, value: T) -> Result<T> {
            if self.telemetry_down {
                Err(BuildPilotError::UpstreamTransient {
                    status: 503,
                    message: "maintenance".into(),
                })
            } else {
                Ok(value)
            }
        }
    }

    fn entry(id: &str, deps: &[&str]) -> QueueEntry {
        QueueEntry {
            build_id: id.to_string(),
            build_type_id: format!("{id}_Type"),
            snapshot_dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..QueueEntry::default()
        }
    }

    #[async_trait]
    impl SubmissionProvider for FakeServer {
        async fn add_build_to_queue(&self, request: &BuildRequest, _move_to_top: bool) -> Result<QueuedBuild> {
            self.record(format!("submit:{}", request.build_type_id));
            if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            if self.rejected_types.contains(&request.build_type_id) {
                return Err(BuildPilotError::UpstreamClient {
                    status: 400,
                    message: format!("No build type {}", request.build_type_id),
                });
            }

            let mut queue = self.queue.lock().unwrap();
            let build_id = format!("{}", 1000 + queue.len());
            queue.push(QueueEntry {
                build_id: build_id.clone(),
                build_type_id: request.build_type_id.clone(),
                ..QueueEntry::default()
            });

            Ok(QueuedBuild {
                build_id,
                build_type_id: request.build_type_id.clone(),
                branch_name: request.branch_name.clone(),
                queue_position: queue.len() as u32,
                queued_date: Utc::now(),
                estimated_start_time: None,
                estimated_duration: None,
                web_url: String::new(),
                personal: request.personal,
                triggered_by: "tests".into(),
                parameters: IndexMap::new(),
            })
        }

        async fn cancel_queued_build(&self, build_id: &str, _comment: Option<&str>) -> Result<()> {
            self.record(format!("cancel:{build_id}"));
            self.queue.lock().unwrap().retain(|e| e.build_id != build_id);
            Ok(())
        }

        async fn set_queued_builds_order(&self, build_ids: &[String]) -> Result<()> {
            self.record(format!("order:{}", build_ids.join(",")));
            let mut queue = self.queue.lock().unwrap();
            let mut head = Vec::new();
            for id in build_ids {
                if let Some(idx) = queue.iter().position(|e| &e.build_id == id) {
                    head.push(queue.remove(idx));
                }
            }
            head.append(&mut queue);
            *queue = head;
            Ok(())
        }
    }

    #[async_trait]
    impl QueueProvider for FakeServer {
        async fn list_queued_builds(&self) -> Result<Vec<QueueEntry>> {
            self.record("list");
            Ok(self.queue.lock().unwrap().clone())
        }

        async fn build_state(&self, build_id: &str) -> Result<Option<BuildState>> {
            self.record(format!("state:{build_id}"));
            Ok(self.states.get(build_id).copied())
        }

        async fn max_concurrent_builds(&self, _build_type_id: &str) -> Result<Option<u32>> {
            self.telemetry(self.max_concurrent)
        }

        async fn running_build_count(&self, _build_type_id: &str) -> Result<usize> {
            self.telemetry(self.running)
        }

        async fn queued_build_count(&self, _build_type_id: &str) -> Result<usize> {
            self.telemetry(self.queue.lock().unwrap().len())
        }

        async fn personal_build_count(&self, _build_type_id: &str) -> Result<usize> {
            self.telemetry(self.personal_queued)
        }

        async fn compatible_agent_count(&self, _build_type_id: &str) -> Result<usize> {
            self.telemetry(self.agents)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(10),
            backoff: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }

    fn orchestrator(server: &Arc<FakeServer>) -> BuildQueueOrchestrator {
        BuildQueueOrchestrator::new(
            server.clone(),
            server.clone(),
            Arc::new(CircuitBreakerManager::default()),
            fast_retry(),
        )
    }

    mod queue_build {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn rejects_duplicate_dependencies_before_any_call() {
            let server = Arc::new(FakeServer::with_queue(vec![]));
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            let request = BuildRequest::new("App_Build").depends_on("X").depends_on("X");
            let err = orchestrator.queue_build(&request).await.unwrap_err();

            assert!(
                matches!(&err, BuildPilotError::Validation(msg) if msg.contains('X')),
                "unexpected error: {err:?}"
            );
            assert!(server.calls().is_empty(), "no call may reach the server");
            assert!(matches!(events.try_recv(), Ok(QueueEvent::Error { .. })));
        }

        #[tokio::test(start_paused = true)]
        async fn submits_and_publishes_queued_event() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("1", &[])]));
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            let build = orchestrator
                .queue_build(&BuildRequest::new("App_Build").with_branch("main"))
                .await
                .unwrap();

            assert_eq!(build.queue_position, 2);
            assert_eq!(build.branch_name.as_deref(), Some("main"));
            match events.try_recv() {
                Ok(QueueEvent::Queued { build: published }) => assert_eq!(published, build),
                other => panic!("expected queued event, got {other:?}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn never_retries_client_errors() {
            let server = Arc::new(FakeServer {
                rejected_types: HashSet::from(["Missing".to_string()]),
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server);

            let err = orchestrator
                .queue_build(&BuildRequest::new("Missing"))
                .await
                .unwrap_err();

            assert!(err.is_client_error());
            assert_eq!(server.count_calls("submit"), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn retries_transient_failures() {
            let server = Arc::new(FakeServer::with_queue(vec![]));
            server.submit_failures.lock().unwrap().extend([
                BuildPilotError::UpstreamTransient {
                    status: 502,
                    message: "bad gateway".into(),
                },
                BuildPilotError::UpstreamTransient {
                    status: 429,
                    message: "slow down".into(),
                },
            ]);
            let orchestrator = orchestrator(&server);

            let build = orchestrator.queue_build(&BuildRequest::new("App_Build")).await;

            assert!(build.is_ok(), "third attempt should succeed: {build:?}");
            assert_eq!(server.count_calls("submit"), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn open_circuit_ends_retries() {
            let server = Arc::new(FakeServer::with_queue(vec![]));
            server.submit_failures.lock().unwrap().extend([
                BuildPilotError::UpstreamTransient {
                    status: 503,
                    message: "down".into(),
                },
                BuildPilotError::UpstreamTransient {
                    status: 503,
                    message: "down".into(),
                },
            ]);
            let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            }));
            let orchestrator =
                BuildQueueOrchestrator::new(server.clone(), server.clone(), breakers, fast_retry());

            let err = orchestrator
                .queue_build(&BuildRequest::new("App_Build"))
                .await
                .unwrap_err();

            assert!(err.is_circuit_open(), "unexpected error: {err:?}");
            assert_eq!(server.count_calls("submit"), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn refuses_when_concurrency_limit_reached() {
            let server = Arc::new(FakeServer {
                max_concurrent: Some(2),
                running: 2,
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server);

            let err = orchestrator
                .queue_build(&BuildRequest::new("App_Build"))
                .await
                .unwrap_err();

            assert!(matches!(err, BuildPilotError::CapacityExceeded { .. }));
            assert_eq!(server.count_calls("submit"), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn refuses_personal_builds_over_quota() {
            let server = Arc::new(FakeServer {
                personal_queued: 3,
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server).with_config(OrchestratorConfig {
                max_personal_builds: Some(3),
                ..OrchestratorConfig::default()
            });

            let personal = BuildRequest {
                personal: true,
                ..BuildRequest::new("App_Build")
            };
            assert!(orchestrator.queue_build(&personal).await.is_err());
            assert!(orchestrator.queue_build(&BuildRequest::new("App_Build")).await.is_ok());
        }

        #[tokio::test(start_paused = true)]
        async fn telemetry_outage_does_not_block_submission() {
            let server = Arc::new(FakeServer {
                telemetry_down: true,
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server);

            assert!(orchestrator.queue_build(&BuildRequest::new("App_Build")).await.is_ok());
        }

        #[tokio::test(start_paused = true)]
        async fn moves_new_build_to_top_when_requested() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("1", &[]), entry("2", &[])]));
            let orchestrator = orchestrator(&server);

            let request = BuildRequest {
                move_to_top: true,
                ..BuildRequest::new("App_Build")
            };
            let build = orchestrator.queue_build(&request).await.unwrap();

            assert_eq!(build.queue_position, 1);
            assert_eq!(server.queue_ids(), vec!["1002", "1", "2"]);
        }
    }

    mod queue_builds {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn returns_only_successes_and_reports_failures() {
            let server = Arc::new(FakeServer {
                rejected_types: HashSet::from(["Broken".to_string()]),
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            let requests = vec![
                BuildRequest::new("First"),
                BuildRequest::new("Broken"),
                BuildRequest::new("Third"),
            ];
            let queued = orchestrator.queue_builds(&requests).await;

            let types: Vec<_> = queued.iter().map(|b| b.build_type_id.as_str()).collect();
            assert_eq!(types, vec!["First", "Third"]);

            let partial = loop {
                match events.try_recv() {
                    Ok(QueueEvent::BatchPartial { succeeded, failures }) => break (succeeded, failures),
                    Ok(_) => continue,
                    Err(TryRecvError::Empty) => panic!("no batch:partial event"),
                    Err(err) => panic!("event channel failed: {err}"),
                }
            };
            assert_eq!(partial.0, 2);
            assert_eq!(partial.1.len(), 1);
            assert_eq!(partial.1[0].index, 1);
            assert_eq!(partial.1[0].build_type_id, "Broken");
        }

        #[tokio::test(start_paused = true)]
        async fn no_partial_event_when_everything_succeeds() {
            let server = Arc::new(FakeServer::with_queue(vec![]));
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            let requests: Vec<_> = (0..7).map(|i| BuildRequest::new(format!("T{i}"))).collect();
            assert_eq!(orchestrator.queue_builds(&requests).await.len(), 7);

            while let Ok(event) = events.try_recv() {
                assert!(matches!(event, QueueEvent::Queued { .. }), "unexpected {event:?}");
            }
        }
    }

    mod get_queue_position {
        use super::*;

        #[tokio::test]
        async fn dependency_still_queued_blocks_the_build() {
            let server = Arc::new(FakeServer::with_queue(vec![
                entry("A", &[]),
                entry("B", &["C"]),
                entry("C", &[]),
            ]));
            let orchestrator = orchestrator(&server);

            let position = orchestrator.get_queue_position("B").await.unwrap();

            assert_eq!(position.position, 2);
            assert!(!position.can_move_to_top);
            assert_eq!(position.blocked_by, vec!["C"]);
        }

        #[tokio::test]
        async fn finished_dependencies_do_not_block() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("A", &[]), entry("B", &["Gone"])]));
            let orchestrator = orchestrator(&server);

            let position = orchestrator.get_queue_position("B").await.unwrap();
            assert!(position.blocked_by.is_empty());
            assert!(position.can_move_to_top);
        }

        #[tokio::test]
        async fn build_that_left_the_queue_is_position_zero() {
            let server = Arc::new(FakeServer {
                states: HashMap::from([("Z".to_string(), BuildState::Running)]),
                ..FakeServer::with_queue(vec![entry("A", &[])])
            });
            let orchestrator = orchestrator(&server);

            let position = orchestrator.get_queue_position("Z").await.unwrap();
            assert_eq!(position.position, 0);
            assert!(!position.is_queued());
        }

        #[tokio::test]
        async fn unknown_build_is_not_found() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("A", &[])]));
            let orchestrator = orchestrator(&server);

            let err = orchestrator.get_queue_position("nope").await.unwrap_err();
            assert!(matches!(err, BuildPilotError::NotFoundInQueue(id) if id == "nope"));
        }
    }

    mod move_to_top {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn head_of_queue_is_returned_unchanged() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("A", &[]), entry("B", &[])]));
            let orchestrator = orchestrator(&server);

            let position = orchestrator.move_to_top("A").await.unwrap();

            assert_eq!(position.position, 1);
            assert_eq!(server.count_calls("order"), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn blocked_build_lists_its_blockers() {
            let server = Arc::new(FakeServer::with_queue(vec![
                entry("A", &[]),
                entry("B", &["C", "D"]),
                entry("C", &[]),
                entry("D", &[]),
            ]));
            let orchestrator = orchestrator(&server);

            let err = orchestrator.move_to_top("B").await.unwrap_err();

            assert_eq!(err.to_string(), "Build B is blocked by: C, D");
            assert_eq!(server.count_calls("order"), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn returns_position_read_after_the_move() {
            let server = Arc::new(FakeServer::with_queue(vec![
                entry("A", &[]),
                entry("B", &[]),
                entry("C", &[]),
            ]));
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            let position = orchestrator.move_to_top("C").await.unwrap();

            assert_eq!(position.position, 1);
            assert_eq!(server.queue_ids(), vec!["C", "A", "B"]);
            assert_eq!(server.count_calls("order:C"), 1);
            let calls = server.calls();
            assert_eq!(calls.last().map(String::as_str), Some("list"), "must re-read the queue");
            assert!(matches!(events.try_recv(), Ok(QueueEvent::MovedToTop { .. })));
        }
    }

    mod reorder_queue {
        use super::*;

        fn ids(ids: &[&str]) -> Vec<String> {
            ids.iter().map(|id| id.to_string()).collect()
        }

        #[tokio::test(start_paused = true)]
        async fn rejects_empty_and_duplicate_orders() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("A", &[])]));
            let orchestrator = orchestrator(&server);

            assert!(matches!(
                orchestrator.reorder_queue(&[]).await,
                Err(BuildPilotError::Validation(_))
            ));
            assert!(matches!(
                orchestrator.reorder_queue(&ids(&["A", "A"])).await,
                Err(BuildPilotError::Validation(_))
            ));
            assert!(server.calls().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn blocked_build_aborts_before_mutation() {
            let server = Arc::new(FakeServer::with_queue(vec![
                entry("A", &[]),
                entry("B", &["A"]),
                entry("C", &[]),
            ]));
            let orchestrator = orchestrator(&server);

            let err = orchestrator.reorder_queue(&ids(&["C", "B"])).await.unwrap_err();

            assert!(matches!(err, BuildPilotError::Blocked { ref build_id, .. } if build_id == "B"));
            assert_eq!(server.count_calls("order"), 0);
            assert_eq!(server.queue_ids(), vec!["A", "B", "C"]);
        }

        #[tokio::test(start_paused = true)]
        async fn applies_one_order_call_and_rereads_positions() {
            let server = Arc::new(FakeServer::with_queue(vec![
                entry("A", &[]),
                entry("B", &[]),
                entry("C", &[]),
            ]));
            let orchestrator = orchestrator(&server);

            let positions = orchestrator.reorder_queue(&ids(&["C", "B"])).await.unwrap();

            assert_eq!(server.count_calls("order"), 1);
            let by_id: Vec<_> = positions.iter().map(|p| (p.build_id.as_str(), p.position)).collect();
            assert_eq!(by_id, vec![("C", 1), ("B", 2)]);
        }
    }

    mod get_queue_limitations {
        use super::*;

        #[tokio::test]
        async fn aggregates_independent_reads() {
            let server = Arc::new(FakeServer {
                max_concurrent: Some(4),
                running: 3,
                personal_queued: 1,
                ..FakeServer::with_queue(vec![entry("A", &[]), entry("B", &[])])
            });
            let orchestrator = orchestrator(&server);

            let limits = orchestrator.get_queue_limitations("App_Build").await;

            assert_eq!(limits.max_concurrent_builds, Some(4));
            assert_eq!(limits.currently_running, 3);
            assert_eq!(limits.queued_builds, 2);
            assert_eq!(limits.personal_builds_queued, 1);
            assert_eq!(limits.available_agents, 2);
            assert!(!limits.concurrency_reached());
        }

        #[tokio::test]
        async fn falls_back_to_conservative_defaults() {
            let server = Arc::new(FakeServer {
                telemetry_down: true,
                ..FakeServer::with_queue(vec![])
            });
            let orchestrator = orchestrator(&server);

            let limits = orchestrator.get_queue_limitations("App_Build").await;
            assert_eq!(limits, QueueLimitations::conservative("App_Build"));
        }
    }

    mod cancel_queued_build {
        use super::*;

        #[tokio::test]
        async fn removes_build_and_publishes_event() {
            let server = Arc::new(FakeServer::with_queue(vec![entry("A", &[]), entry("B", &[])]));
            let orchestrator = orchestrator(&server);
            let mut events = orchestrator.subscribe();

            orchestrator.cancel_queued_build("A", None).await.unwrap();

            assert_eq!(server.queue_ids(), vec!["B"]);
            assert!(matches!(events.try_recv(), Ok(QueueEvent::Canceled { build_id }) if build_id == "A"));
        }
    }
}
