//! Failure isolation for calls to the build server.
//!
//! [`RetryExecutor`] re-attempts a fallible async operation with exponential
//! backoff. [`CircuitBreaker`] stops calling an endpoint that keeps failing
//! until a cool-down window has passed. The two compose in either order:
//!
//! - retry wrapping breaker: every attempt is counted by the breaker, and a
//!   [`CircuitOpenError`] ends the retry loop because it is not retryable.
//! - breaker wrapping retry: one logical call is counted once, after its
//!   retries are exhausted.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitOpenError, CircuitState,
    CircuitStats,
};
pub use retry::{RetryExecutor, RetryPolicy};
