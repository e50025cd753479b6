use chrono::Utc;
use tokio::time::Instant;

use super::events::{BuildEvent, ProgressUpdate, StageMetrics, StopReason};
use super::options::TrackingOptions;
use crate::build::{BuildState, BuildStatus};

/// Events produced by one poll, and whether the session ends with them.
#[derive(Debug, Default)]
pub(crate) struct Observation {
    pub events: Vec<BuildEvent>,
    pub terminal: bool,
}

/// Everything a session remembers between polls of one build.
#[derive(Debug)]
pub(crate) struct TrackingState {
    build_id: String,
    last_update: Option<BuildStatus>,
    last_progress: Option<f64>,
    last_progress_time: Instant,
    velocity: Option<f64>,
    current_stage: Option<String>,
    stage_started_at: Instant,
    stage_start_progress: f64,
    historical_duration: Option<f64>,
    history_loaded: bool,
    pub poll_count: u32,
    pub error_count: u32,
}

impl TrackingState {
    pub fn new(build_id: &str, now: Instant) -> Self {
        Self {
            build_id: build_id.to_string(),
            last_update: None,
            last_progress: None,
            last_progress_time: now,
            velocity: None,
            current_stage: None,
            stage_started_at: now,
            stage_start_progress: 0.0,
            historical_duration: None,
            history_loaded: false,
            poll_count: 0,
            error_count: 0,
        }
    }

    pub fn last_state(&self) -> Option<BuildState> {
        self.last_update.as_ref().map(|s| s.state)
    }

    pub fn needs_history(&self, options: &TrackingOptions) -> bool {
        options.use_historical_data && !self.history_loaded
    }

    /// Stores the average of recent build durations. Called at most once per session.
    pub fn set_history(&mut self, durations: &[f64]) {
        self.history_loaded = true;
        if !durations.is_empty() {
            self.historical_duration = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
    }

    /// Folds a successful poll into the state.
    pub fn observe(&mut self, status: BuildStatus, now: Instant, options: &TrackingOptions) -> Observation {
        self.poll_count += 1;
        self.error_count = 0;

        let previous_state = self.last_state();
        let percentage = status
            .percentage_complete
            .unwrap_or(if status.is_finished() { 100.0 } else { 0.0 })
            .clamp(0.0, 100.0);
        let mut events = Vec::new();

        match status.state {
            BuildState::Queued if previous_state != Some(BuildState::Queued) => {
                events.push(BuildEvent::Queued {
                    build_id: self.build_id.clone(),
                    queue_position: status.queue_position,
                    wait_reason: status.wait_reason.clone(),
                });
            }
            BuildState::Running if previous_state != Some(BuildState::Running) => {
                // Time spent waiting in the queue is not stall time
                self.last_progress = Some(percentage);
                self.last_progress_time = now;
                self.stage_started_at = now;
                self.stage_start_progress = percentage;
                events.push(BuildEvent::Started {
                    build_id: self.build_id.clone(),
                    web_url: status.web_url.clone(),
                });
            }
            _ => {}
        }

        self.track_progress(percentage, now, options);

        if options.track_stages && status.state == BuildState::Running {
            if let Some(stage) = status.current_stage_text.as_deref() {
                self.enter_stage(stage, percentage, now, options, &mut events);
            }
        }

        events.push(BuildEvent::Progress(self.progress_update(&status, percentage)));

        if status.state == BuildState::Running {
            let flat_for = now.duration_since(self.last_progress_time);
            if percentage < 100.0 && flat_for > options.stall_threshold {
                events.push(BuildEvent::Stalled {
                    build_id: self.build_id.clone(),
                    percentage_complete: percentage,
                    stalled_for_seconds: flat_for.as_secs_f64(),
                });
            }
        }

        let terminal = status.is_finished();
        if terminal {
            if options.track_stages {
                if let Some(stage) = self.current_stage.take() {
                    events.push(self.stage_completed(stage, percentage, now, options));
                }
            }
            events.push(terminal_event(&self.build_id, &status));
        }

        self.last_update = Some(status);
        Observation { events, terminal }
    }

    /// Counts a failed poll. The session ends once the error budget is spent.
    pub fn record_failure(&mut self, message: String, options: &TrackingOptions) -> Observation {
        self.error_count += 1;
        let mut events = vec![BuildEvent::Error {
            build_id: self.build_id.clone(),
            message,
            error_count: self.error_count,
        }];

        let terminal = self.error_count >= options.max_retries;
        if terminal {
            events.push(BuildEvent::Stopped {
                build_id: self.build_id.clone(),
                reason: StopReason::MaxRetriesExceeded,
            });
        }

        Observation { events, terminal }
    }

    fn track_progress(&mut self, percentage: f64, now: Instant, options: &TrackingOptions) {
        let Some(last) = self.last_progress else {
            self.last_progress = Some(percentage);
            self.last_progress_time = now;
            return;
        };

        if percentage > last && options.calculate_velocity {
            let seconds = now.duration_since(self.last_progress_time).as_secs_f64();
            if seconds > 0.0 {
                self.velocity = Some((percentage - last) / seconds);
            }
        }

        if percentage != last {
            self.last_progress = Some(percentage);
            self.last_progress_time = now;
        }
    }

    fn enter_stage(
        &mut self,
        stage: &str,
        percentage: f64,
        now: Instant,
        options: &TrackingOptions,
        events: &mut Vec<BuildEvent>,
    ) {
        if self.current_stage.as_deref() == Some(stage) {
            return;
        }

        let previous = self.current_stage.take();
        if let Some(done) = previous.clone() {
            events.push(self.stage_completed(done, percentage, now, options));
        }
        events.push(BuildEvent::StageChanged {
            build_id: self.build_id.clone(),
            previous,
            stage: stage.to_string(),
        });

        self.current_stage = Some(stage.to_string());
        self.stage_started_at = now;
        self.stage_start_progress = percentage;
    }

    fn stage_completed(&self, stage: String, percentage: f64, now: Instant, options: &TrackingOptions) -> BuildEvent {
        let metrics = options.calculate_stage_metrics.then(|| {
            let duration_seconds = now.duration_since(self.stage_started_at).as_secs_f64();
            let progress_delta = percentage - self.stage_start_progress;
            StageMetrics {
                duration_seconds,
                progress_delta,
                progress_rate: (duration_seconds > 0.0).then(|| progress_delta / duration_seconds),
            }
        });

        BuildEvent::StageCompleted {
            build_id: self.build_id.clone(),
            stage,
            metrics,
        }
    }

    fn progress_update(&self, status: &BuildStatus, percentage: f64) -> ProgressUpdate {
        let estimated_total_seconds = status.estimated_total_seconds.or(self.historical_duration);
        let elapsed_seconds = status.elapsed_seconds;

        let velocity = self.velocity.filter(|v| *v > 0.0);
        let estimated_remaining_seconds = if status.is_finished() {
            Some(0.0)
        } else {
            velocity
                .map(|v| (100.0 - percentage) / v)
                .or_else(|| Some((estimated_total_seconds? - elapsed_seconds?).max(0.0)))
        };

        let overdue_seconds = match (elapsed_seconds, estimated_total_seconds) {
            (Some(elapsed), Some(total)) if elapsed > total => Some(elapsed - total),
            _ => None,
        };

        ProgressUpdate {
            build_id: self.build_id.clone(),
            state: status.state,
            percentage_complete: percentage,
            current_stage: self.current_stage.clone().or_else(|| status.current_stage_text.clone()),
            status_text: status.status_text.clone(),
            elapsed_seconds,
            estimated_total_seconds,
            estimated_remaining_seconds,
            velocity,
            overdue: overdue_seconds.is_some(),
            overdue_seconds,
            queue_position: status.queue_position,
            tests: status.tests,
            problems: status.problems.clone(),
            poll_count: self.poll_count,
            timestamp: Utc::now(),
        }
    }
}

fn terminal_event(build_id: &str, status: &BuildStatus) -> BuildEvent {
    let build_id = build_id.to_string();
    let status = status.clone();
    if status.canceled {
        BuildEvent::Canceled { build_id, status }
    } else if status.is_successful() {
        BuildEvent::Completed { build_id, status }
    } else {
        BuildEvent::Failed { build_id, status }
    }
}
