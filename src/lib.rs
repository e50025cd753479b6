//! Orchestration of TeamCity build queues.
//!
//! [`queue::BuildQueueOrchestrator`] submits, reorders and cancels queued
//! builds behind per-endpoint circuit breakers and retries, and
//! [`monitor::BuildProgressMonitor`] follows builds until they finish.

pub mod auth;
pub mod build;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod monitor;
pub mod output;
pub mod providers;
pub mod queue;
pub mod resilience;

pub use error::{BuildPilotError, Result};
