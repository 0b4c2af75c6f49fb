//! Retry - Generic retry loops for eventually consistent APIs
//!
//! Operations report the outcome of a single attempt as an [`Attempt`];
//! the loops here decide whether to try again.

use std::future::Future;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::time::Instant;

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The operation completed
    Success(T),
    /// The operation failed in a way that may clear up; try again.
    Retry(E),
    /// The operation failed and retrying will not help
    Fail(E),
}

impl<T, E> Attempt<T, E> {
    pub fn retry(error: E) -> Self {
        Attempt::Retry(error)
    }
}

/// Why a retry loop gave up
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// A non-retryable failure
    #[error(transparent)]
    Failed(E),

    /// The overall window elapsed before the operation succeeded
    #[error("timeout after {timeout:?} while waiting for operation to succeed")]
    Timeout {
        timeout: Duration,
        #[source]
        last_error: Option<E>,
    },

    /// The attempt limit was reached
    #[error("exhausted {attempts} retries, last error: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::Timeout { .. })
    }

    /// The last error reported by the operation, if any
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Timeout { last_error, .. } => last_error.as_ref(),
            RetryError::Exhausted { last_error, .. } => Some(last_error),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Timeout { last_error, .. } => last_error,
            RetryError::Exhausted { last_error, .. } => Some(last_error),
        }
    }
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2,
        }
    }

    /// Fixed delay between attempts
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// Run `op` until it succeeds, fails fatally, or `timeout` elapses.
///
/// An attempt still in flight when the window closes is abandoned.
pub async fn retry_with_timeout<T, E, F, Fut>(
    timeout: Duration,
    backoff: Backoff,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut next_delay = backoff.initial;
    let mut last_error = None;
    let mut attempt = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RetryError::Timeout {
                timeout,
                last_error,
            });
        }

        attempt += 1;
        let outcome = match tokio::time::timeout(remaining, op()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(RetryError::Timeout {
                    timeout,
                    last_error,
                });
            }
        };

        match outcome {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fail(error) => return Err(RetryError::Failed(error)),
            Attempt::Retry(error) => {
                let wait = next_delay;
                next_delay = backoff.next(next_delay);
                debug!("attempt {} failed, retrying in {:?}: {}", attempt, wait, error);
                last_error = Some(error);

                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(wait.min(remaining)).await;
            }
        }
    }
}

/// Attempt limit and linear step for [`retry_when`]
#[derive(Debug, Clone, Copy)]
pub struct RetryWhen {
    pub max_attempts: u32,
    pub step: Duration,
}

impl Default for RetryWhen {
    fn default() -> Self {
        // 22.5 seconds of waiting across 10 attempts
        Self {
            max_attempts: 10,
            step: Duration::from_millis(500),
        }
    }
}

/// Retry `op` while `should_retry` classifies its error as transient.
///
/// Attempt `i` (zero based) waits `(i + 1) * step` before the next one.
/// No wait follows the final attempt.
pub async fn retry_when<T, E, F, Fut, P>(
    policy: RetryWhen,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    // max_attempts == 0 still owes one unconditional attempt
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if should_retry(&error) && attempt < policy.max_attempts => {
                let wait = policy.step.saturating_mul(attempt);
                debug!(
                    "retryable error on attempt {}/{}, waiting {:?}: {}",
                    attempt, policy.max_attempts, wait, error
                );
                tokio::time::sleep(wait).await;
            }
            Err(error) if should_retry(&error) && policy.max_attempts > 0 => {
                return Err(RetryError::Exhausted {
                    attempts: policy.max_attempts,
                    last_error: error,
                });
            }
            Err(error) => return Err(RetryError::Failed(error)),
        }
    }
}
