//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed   -> Open:     failure_count >= failure_threshold
//! Open     -> HalfOpen: next call after reset_timeout has elapsed
//! HalfOpen -> Closed:   success_threshold consecutive successes
//! HalfOpen -> Open:     any failure
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Returned instead of calling the protected operation while the circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for endpoint '{endpoint}'")]
pub struct CircuitOpenError {
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive successes that close a half-open circuit
    pub success_threshold: u32,
    /// How long an open circuit fails fast before probing again
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_time: None,
        }
    }
}

pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// While open and inside the reset window the operation is not invoked and
    /// a [`CircuitOpenError`] is returned. Errors from the operation itself are
    /// counted and passed through untouched.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.lock();
        CircuitStats {
            endpoint: self.endpoint.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
        }
    }

    pub fn reset(&self) {
        *self.lock() = BreakerState::default();
        info!("Circuit for '{}' reset to closed", self.endpoint);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // A panic while holding the lock cannot leave the counters half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_call(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let cooled_down = state
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.config.reset_timeout);

        if cooled_down {
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            info!("Circuit for '{}' half-open, probing upstream", self.endpoint);
            Ok(())
        } else {
            debug!("Circuit for '{}' open, failing fast", self.endpoint);
            Err(CircuitOpenError {
                endpoint: self.endpoint.clone(),
            })
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        state.failure_count = 0;

        if state.state == CircuitState::HalfOpen {
            state.success_count += 1;
            if state.success_count >= self.config.success_threshold {
                state.state = CircuitState::Closed;
                state.success_count = 0;
                state.opened_at = None;
                info!("Circuit for '{}' closed", self.endpoint);
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Utc::now());

        let should_open = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            state.state = CircuitState::Open;
            state.success_count = 0;
            state.opened_at = Some(Instant::now());
            warn!(
                "Circuit for '{}' opened after {} failure(s), failing fast for {}ms",
                self.endpoint,
                state.failure_count,
                self.config.reset_timeout.as_millis()
            );
        }
    }
}

/// Lazily creates and owns one [`CircuitBreaker`] per endpoint key.
///
/// Entries are never evicted; the set of endpoints is small and fixed.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        Arc::clone(
            breakers
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config))),
        )
    }

    pub async fn execute<T, E, F, Fut>(&self, endpoint: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.get_breaker(endpoint).execute(operation).await
    }

    /// Resets one breaker. Returns `false` if the endpoint was never used.
    pub fn reset(&self, endpoint: &str) -> bool {
        let breaker = self.lock().get(endpoint).cloned();
        breaker.map(|b| b.reset()).is_some()
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
