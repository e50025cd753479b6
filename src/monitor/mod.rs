//! Polling-based progress tracking of individual builds.
//!
//! A session moves through
//!
//! ```text
//! Queued ──▶ Started ──▶ Completed | Failed | Canceled
//! ```
//!
//! and reports `Progress` after every poll. While the build runs, stage
//! transitions add `StageCompleted` and `StageChanged`, and flat progress past
//! the stall threshold adds `Stalled` on every poll. `Error` is reported for
//! every failed poll and `Stopped` ends a session that did not reach a
//! terminal build state.

mod events;
mod options;
mod state;
mod tracker;

pub use events::{BuildEvent, ProgressUpdate, StageMetrics, StopReason};
pub use options::TrackingOptions;
pub use tracker::BuildProgressMonitor;
