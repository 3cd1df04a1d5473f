//! Bounded exponential retry for per-node remote actions

use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub use ::backoff::ExponentialBackoff;
pub use ::backoff::Error as BackoffError;
use ::backoff::future::retry_notify;

use crate::error::OpsError;

/// Retry budget for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay; every following delay doubles
    pub initial: Duration,
    /// Upper bound on the time spent retrying
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_wait: Duration) -> Self {
        Self { initial, max_wait }
    }

    /// Fresh backoff schedule for one retried call
    ///
    /// Delays are not randomized, so the schedule is 1x, 2x, 4x ... the
    /// initial step until `max_wait` has elapsed.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_wait,
            max_elapsed_time: Some(self.max_wait),
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(300),
            max_wait: Duration::from_secs(3),
        }
    }
}

fn classify(e: OpsError) -> BackoffError<OpsError> {
    if e.is_retryable() {
        BackoffError::transient(e)
    } else {
        BackoffError::permanent(e)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// budget runs out
///
/// Returns the last error on exhaustion.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, OpsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OpsError>>,
{
    let mut attempt = 0;
    let result = retry_notify(
        policy.backoff(),
        || {
            let pending = op();
            async move { pending.await.map_err(classify) }
        },
        |e: OpsError, delay: Duration| {
            attempt += 1;
            warn!(
                "{} failed (attempt {}): {}, retrying in {:?}",
                what, attempt, e, delay
            );
        },
    )
    .await;

    if let Err(e) = &result {
        if e.is_retryable() {
            warn!("{} failed after {} attempt(s): {}", what, attempt + 1, e);
        }
    }
    result
}
