//! Exponential backoff for retried collaborator calls.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`.
//! [`retry`] stops once the next delay would push the total time past
//! `max_elapsed`, or when the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry backoff policy.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub first: Duration,
    /// Cap for a single delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Give up once this much time has passed. `None` retries forever.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 1.5,
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }
}

impl BackoffPolicy {
    /// Policy for build script generation.
    #[must_use]
    pub fn script_generation() -> Self {
        Self::default()
    }

    /// Policy for publishing log parts.
    #[must_use]
    pub fn log_publish() -> Self {
        Self {
            max_elapsed: Some(Duration::from_secs(180)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, runs out
/// of time or `cancel` fires. The last error is returned in every failure case.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut retryable: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !retryable(&err) {
            return Err(err);
        }

        let delay = policy.next(attempt);
        if policy
            .max_elapsed
            .is_some_and(|max| started.elapsed() + delay > max)
        {
            return Err(err);
        }

        tracing::debug!(attempt, delay_ms = delay.as_millis(), error = %err, "retrying");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => return Err(err),
        }
        attempt = attempt.saturating_add(1);
    }
}
