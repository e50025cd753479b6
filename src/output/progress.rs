use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{bright_green, bright_red, bright_yellow, cyan, dim, format_seconds};
use crate::monitor::{BuildEvent, ProgressUpdate, StopReason};

/// Live progress bar for one tracked build, driven by its event stream.
pub struct BuildProgressView {
    pb: ProgressBar,
}

impl BuildProgressView {
    pub fn new(build_id: &str) -> Self {
        eprintln!("{}  {}", cyan("⏱"), cyan(format!("Watching build {build_id}")).underlined());

        let pb = ProgressBar::new(100);
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.set_style(
            ProgressStyle::with_template("  {bar:40.cyan/blue} {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
        pb.set_message(dim("waiting for first poll").to_string());
        Self { pb }
    }

    /// Applies one event. Returns `true` once the session has ended.
    pub fn handle(&self, event: &BuildEvent) -> bool {
        match event {
            BuildEvent::Queued {
                queue_position,
                wait_reason,
                ..
            } => {
                let position = queue_position.map_or_else(String::new, |p| format!(" at position {p}"));
                let reason = wait_reason
                    .as_deref()
                    .map_or_else(String::new, |r| format!(" ({r})"));
                self.pb
                    .set_message(bright_yellow(format!("queued{position}{reason}")).to_string());
            }
            BuildEvent::Started { web_url, .. } => {
                if let Some(url) = web_url {
                    self.pb.println(format!("  {} {}", dim("started:"), url));
                }
            }
            BuildEvent::Progress(update) => self.render(update),
            BuildEvent::Stalled {
                stalled_for_seconds,
                ..
            } => {
                self.pb.set_message(
                    bright_yellow(format!("no progress for {}", format_seconds(*stalled_for_seconds)))
                        .to_string(),
                );
            }
            BuildEvent::StageCompleted { stage, metrics, .. } => {
                let took = metrics
                    .as_ref()
                    .map_or_else(String::new, |m| format!(" in {}", format_seconds(m.duration_seconds)));
                self.pb
                    .println(format!("  {} {stage}{took}", bright_green("✓")));
            }
            BuildEvent::StageChanged { .. } => {}
            BuildEvent::Completed { .. } => {
                self.pb.set_position(100);
                self.pb
                    .finish_with_message(bright_green("completed successfully ✓").to_string());
            }
            BuildEvent::Failed { status, .. } => {
                let text = status.status_text.as_deref().unwrap_or("build failed");
                self.pb.abandon_with_message(bright_red(format!("failed: {text}")).to_string());
            }
            BuildEvent::Canceled { .. } => {
                self.pb.abandon_with_message(bright_yellow("canceled").to_string());
            }
            BuildEvent::Stopped { reason, .. } => {
                let text = match reason {
                    StopReason::Manual => "stopped",
                    StopReason::MaxRetriesExceeded => "stopped: too many failed polls",
                    StopReason::MaxDurationExceeded => "stopped: watch time limit reached",
                };
                self.pb.abandon_with_message(bright_yellow(text).to_string());
            }
            BuildEvent::Error {
                message,
                error_count,
                ..
            } => {
                self.pb.println(format!(
                    "  {} poll failed ({error_count}): {message}",
                    bright_red("!")
                ));
            }
        }

        event.is_terminal()
    }

    fn render(&self, update: &ProgressUpdate) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let position = update.percentage_complete.round() as u64;
        self.pb.set_position(position);

        let mut parts = Vec::new();
        if let Some(stage) = &update.current_stage {
            parts.push(stage.clone());
        }
        if let Some(remaining) = update.estimated_remaining_seconds.filter(|_| !update.overdue) {
            parts.push(format!("~{} left", format_seconds(remaining)));
        }
        if let Some(overdue) = update.overdue_seconds {
            parts.push(bright_red(format!("overdue by {}", format_seconds(overdue))).to_string());
        }
        if !parts.is_empty() {
            self.pb.set_message(parts.join(" · "));
        }
    }
}
