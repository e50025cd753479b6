use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;

/// Backoff schedule for [`RetryExecutor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given (1-based) failed attempt:
    /// `min(delay * backoff^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(0.0).powi(exponent);
        let millis = self.delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);

        if capped.is_finite() && capped >= 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }
}

type ShouldRetry<E> = Box<dyn Fn(&E, u32) -> bool + Send + Sync>;
type OnRetry<E> = Box<dyn Fn(&E, u32) + Send + Sync>;

/// Runs an async operation until it succeeds or the [`RetryPolicy`] gives up.
///
/// The error of the final attempt is returned unchanged, never wrapped.
pub struct RetryExecutor<E> {
    policy: RetryPolicy,
    should_retry: ShouldRetry<E>,
    on_retry: Option<OnRetry<E>>,
}

impl<E> RetryExecutor<E>
where
    E: Display,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: Box::new(|_, _| true),
            on_retry: None,
        }
    }

    /// Decides, per failed attempt, whether another attempt is made.
    #[must_use]
    pub fn should_retry(mut self, predicate: impl Fn(&E, u32) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Box::new(predicate);
        self
    }

    /// Called before sleeping ahead of each retry.
    #[must_use]
    pub fn on_retry(mut self, callback: impl Fn(&E, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !(self.should_retry)(&err, attempt) {
                        return Err(err);
                    }

                    if let Some(on_retry) = &self.on_retry {
                        on_retry(&err, attempt);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {attempt}/{max_attempts} failed ({err}), retrying in {}ms...",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
