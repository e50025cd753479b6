use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::events::{BuildEvent, StopReason};
use super::options::TrackingOptions;
use super::state::{Observation, TrackingState};
use crate::error::Result;
use crate::providers::{resolve_status, StatusProvider};

const HISTORY_SAMPLE: usize = 10;

type Registry = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// One live tracking session. Dropping the last handle closes its event channel.
struct Session {
    build_id: String,
    options: TrackingOptions,
    state: tokio::sync::Mutex<TrackingState>,
    sink: mpsc::UnboundedSender<BuildEvent>,
    token: CancellationToken,
}

/// Follows builds to completion by polling a [`StatusProvider`].
///
/// Every session runs as its own task that alternates between sleeping and
/// polling, so polls of one build never overlap. A session ends when the
/// build finishes, when it is stopped, when its error budget or its maximum
/// duration is spent, or when a new session for the same build replaces it.
/// Results of a poll that completes after its session ended are dropped.
pub struct BuildProgressMonitor {
    provider: Arc<dyn StatusProvider>,
    sessions: Registry,
}

impl BuildProgressMonitor {
    pub fn new(provider: Arc<dyn StatusProvider>) -> Self {
        Self {
            provider,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts polling `build_id` right away and returns the session's event stream.
    ///
    /// An existing session for the same build is replaced silently: its task
    /// stops and its stream ends without a `Stopped` event.
    pub fn track_build_progress(
        &self,
        build_id: &str,
        options: TrackingOptions,
    ) -> mpsc::UnboundedReceiver<BuildEvent> {
        let (sink, events) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            build_id: build_id.to_string(),
            state: tokio::sync::Mutex::new(TrackingState::new(build_id, Instant::now())),
            options,
            sink,
            token: CancellationToken::new(),
        });

        if let Some(previous) = lock(&self.sessions).insert(build_id.to_string(), Arc::clone(&session)) {
            debug!("Replacing existing tracking session for build {build_id}");
            previous.token.cancel();
        }

        info!("Tracking build {build_id}");
        tokio::spawn(run_session(
            Arc::clone(&self.provider),
            Arc::clone(&self.sessions),
            session,
        ));

        events
    }

    /// Polls a build once.
    ///
    /// When the build has a live session the poll goes through that session,
    /// and its events are also delivered to the session's stream. Otherwise a
    /// throwaway state is used. A failed lookup is returned as an error and
    /// does not count against any session's error budget.
    pub async fn poll_once(&self, build_id: &str, options: &TrackingOptions) -> Result<Vec<BuildEvent>> {
        let session = lock(&self.sessions).get(build_id).cloned();

        let Some(session) = session else {
            let status = resolve_status(self.provider.as_ref(), build_id, options.status_detail()).await?;
            let now = Instant::now();
            let mut state = TrackingState::new(build_id, now);
            return Ok(state.observe(status, now, options).events);
        };

        let mut state = session.state.lock().await;
        let status =
            resolve_status(self.provider.as_ref(), build_id, session.options.status_detail()).await?;
        let observation = state.observe(status, Instant::now(), &session.options);
        drop(state);

        let events = observation.events.clone();
        deliver(&self.sessions, &session, observation);
        Ok(events)
    }

    /// Ends the session for `build_id` with a `Stopped { Manual }` event.
    ///
    /// Returns `false` if the build was not being tracked.
    pub fn stop_tracking(&self, build_id: &str) -> bool {
        let Some(session) = lock(&self.sessions).remove(build_id) else {
            return false;
        };

        session.token.cancel();
        let _ = session.sink.send(BuildEvent::Stopped {
            build_id: build_id.to_string(),
            reason: StopReason::Manual,
        });
        info!("Stopped tracking build {build_id}");
        true
    }

    pub fn stop_all_tracking(&self) {
        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.token.cancel();
            let _ = session.sink.send(BuildEvent::Stopped {
                build_id: session.build_id.clone(),
                reason: StopReason::Manual,
            });
            info!("Stopped tracking build {}", session.build_id);
        }
    }

    /// Ids of builds with a live session, sorted.
    pub fn active_builds(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracking(&self, build_id: &str) -> bool {
        lock(&self.sessions).contains_key(build_id)
    }
}

impl Drop for BuildProgressMonitor {
    fn drop(&mut self) {
        for (_, session) in lock(&self.sessions).drain() {
            session.token.cancel();
        }
    }
}

fn lock(sessions: &Registry) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_current(sessions: &HashMap<String, Arc<Session>>, session: &Arc<Session>) -> bool {
    sessions
        .get(&session.build_id)
        .is_some_and(|current| Arc::ptr_eq(current, session))
}

/// Sends a poll's events if the session is still registered, and tears the
/// session down when they end it. Returns `false` if the session is gone.
fn deliver(sessions: &Registry, session: &Arc<Session>, observation: Observation) -> bool {
    let mut registry = lock(sessions);
    if !is_current(&registry, session) {
        debug!("Discarding late poll result for build {}", session.build_id);
        return false;
    }

    for event in observation.events {
        let _ = session.sink.send(event);
    }

    if observation.terminal {
        registry.remove(&session.build_id);
        session.token.cancel();
        debug!("Tracking session for build {} finished", session.build_id);
        return false;
    }
    true
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_session(provider: Arc<dyn StatusProvider>, sessions: Registry, session: Arc<Session>) {
    let deadline = session.options.max_duration.map(|d| Instant::now() + d);
    let mut delay = Duration::ZERO;

    loop {
        // The deadline and the token also cut short a poll that is still in flight.
        let observation = tokio::select! {
            biased;
            () = session.token.cancelled() => break,
            () = deadline_elapsed(deadline) => {
                info!("Build {} exceeded its tracking budget, stopping", session.build_id);
                let expired = Observation {
                    events: vec![BuildEvent::Stopped {
                        build_id: session.build_id.clone(),
                        reason: StopReason::MaxDurationExceeded,
                    }],
                    terminal: true,
                };
                deliver(&sessions, &session, expired);
                break;
            }
            observation = async {
                sleep(delay).await;
                poll(provider.as_ref(), &session).await
            } => observation,
        };

        if !deliver(&sessions, &session, observation) {
            break;
        }
        delay = session.options.polling_interval;
    }
}

async fn poll(provider: &dyn StatusProvider, session: &Session) -> Observation {
    let options = &session.options;
    let mut state = session.state.lock().await;

    match resolve_status(provider, &session.build_id, options.status_detail()).await {
        Ok(status) => {
            if state.needs_history(options) && !status.build_type_id.is_empty() {
                let durations = provider
                    .recent_durations(&status.build_type_id, HISTORY_SAMPLE)
                    .await
                    .unwrap_or_else(|e| {
                        debug!("No build history for {}: {e}", status.build_type_id);
                        Vec::new()
                    });
                state.set_history(&durations);
            }

            let previous = state.last_state();
            let observation = state.observe(status, Instant::now(), options);
            if previous != state.last_state() {
                debug!(
                    "Build {} is now {:?} (poll {})",
                    session.build_id,
                    state.last_state(),
                    state.poll_count
                );
            }
            observation
        }
        Err(err) => {
            warn!("Polling build {} failed: {err}", session.build_id);
            state.record_failure(err.to_string(), options)
        }
    }
}
