// Retry-with-backoff shared by playlist polls and segment downloads.
//
// Exponential backoff with a delay cap and optional jitter. Attempts are
// classified by the caller; cancellation interrupts the backoff sleep.

use crate::error::RelayError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * 2^n`, before jitter.
    pub base_delay: Duration,
    /// Hard cap on any single delay.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay, never past `max_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Delay before retry `attempt + 1`. Jitter is drawn from the headroom
    /// left under `max_delay`, at most half the base delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let headroom = self
            .max_delay
            .saturating_sub(backoff)
            .min(self.base_delay / 2);
        if !self.jitter || headroom.is_zero() {
            return backoff;
        }
        backoff + headroom.mul_f64(rand::rng().random_range(0.0..1.0))
    }
}

/// Outcome of one attempt as classified by the caller.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure: timeout, connect error, 5xx, 429.
    Retry(RelayError),
    /// Permanent failure: reported immediately.
    Fail(RelayError),
}

impl<T> RetryAction<T> {
    /// Classify a result using [`RelayError::is_retryable`].
    pub fn from_result(result: Result<T, RelayError>) -> Self {
        match result {
            Ok(value) => RetryAction::Success(value),
            Err(err) if err.is_retryable() => RetryAction::Retry(err),
            Err(err) => RetryAction::Fail(err),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget
/// is spent. `on_retry` is told about every retry before the backoff sleep.
pub async fn retry_with_backoff<F, Fut, T, R>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_retry: R,
    operation: F,
) -> Result<T, RelayError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
    R: FnMut(u32, &RelayError),
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        on_retry(attempt + 1, &err);

        tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
