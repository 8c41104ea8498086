//! Generic retry executor with bounded exponential backoff.
//!
//! Knows nothing about browsers or pages: it runs any zero-argument async
//! operation and decides whether to try again from a predicate over the
//! operation's error type.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Retry configuration, passed to [`execute`] per call.
pub struct RetryPolicy<E> {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    retryable: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> RetryPolicy<E> {
    /// Policy that retries every error.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            retryable: Arc::new(|_| true),
        }
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.retryable)(error)
    }

    /// Backoff before the retry that follows failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            retryable: Arc::clone(&self.retryable),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// `min(base * 2^attempt, max)`, saturating instead of overflowing.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Why [`execute`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error; the operation was not attempted again.
    #[error("non-retryable error on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of times the operation ran.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    /// The last error the operation returned.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// has been attempted `policy.max_retries + 1` times.
///
/// Sleeps `policy.delay_for(i)` after failed attempt `i`, except after the
/// last one. Only the calling task is suspended.
pub async fn execute<T, E, F, Fut>(policy: &RetryPolicy<E>, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;

        if !policy.is_retryable(&error) {
            return Err(RetryError::Aborted { attempt, error });
        }

        if attempt >= max_attempts {
            warn!("All {} attempts failed. Last error: {}", attempt, error);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(
            "Attempt {} failed: {}. Retrying in {:.1}s...",
            attempt,
            error,
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
    }
}
