//! Per-job log writer contract.
//!
//! Writers enforce a maximum total length and expose a silence timer that
//! fires when nothing was written for the configured timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LogWriterError;
use crate::job::{Job, JobStartedMeta};

/// Delay before the silence timer fires if nothing was ever written.
pub const INITIAL_SILENCE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Output sink for a single job.
///
/// Writes past the maximum length return `Ok(0)` and cancel the token
/// registered with [`LogWriter::set_cancel_token`]. `close` and
/// `write_and_close` emit the final part once; later calls do nothing.
#[async_trait]
pub trait LogWriter: Send + Sync {
    async fn write(&self, buf: &[u8]) -> Result<usize, LogWriterError>;

    async fn close(&self) -> Result<(), LogWriterError>;

    async fn write_and_close(&self, buf: &[u8]) -> Result<usize, LogWriterError>;

    /// Resolves once the writer saw no output for its timeout.
    async fn timed_out(&self);

    fn set_max_log_length(&self, bytes: usize);

    fn set_job_started(&self, meta: JobStartedMeta);

    fn set_cancel_token(&self, token: CancellationToken);

    fn max_length_reached(&self) -> bool;
}

/// Builds log writers for jobs that do not bring their own.
#[async_trait]
pub trait LogWriterFactory: Send + Sync {
    async fn log_writer(
        &self,
        default_timeout: Duration,
        job: &dyn Job,
    ) -> Result<Arc<dyn LogWriter>, LogWriterError>;
}

/// Re-armable inactivity timer.
#[derive(Debug)]
pub struct SilenceTimer {
    timeout: Duration,
    deadline: Mutex<Option<Instant>>,
    changed: Notify,
}

impl SilenceTimer {
    /// Creates a timer armed for [`INITIAL_SILENCE_TIMEOUT`].
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(Some(Instant::now() + INITIAL_SILENCE_TIMEOUT)),
            changed: Notify::new(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pushes the deadline out by the timeout.
    pub fn reset(&self) {
        *self.deadline.lock() = Some(Instant::now() + self.timeout);
        self.changed.notify_waiters();
    }

    /// Disarms the timer for good.
    pub fn stop(&self) {
        *self.deadline.lock() = None;
        self.changed.notify_waiters();
    }

    /// Waits until the current deadline passes. Never resolves once stopped.
    pub async fn fired(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let deadline = *self.deadline.lock();
            match deadline {
                None => changed.await,
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {
                            let current = *self.deadline.lock();
                            if current.is_some_and(|d| d <= Instant::now()) {
                                return;
                            }
                        }
                        () = &mut changed => {}
                    }
                }
            }
        }
    }
}

/// Running byte count checked against a maximum log length.
#[derive(Debug)]
pub struct LengthLimit {
    max: AtomicUsize,
    written: AtomicUsize,
    reached: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Default for LengthLimit {
    fn default() -> Self {
        Self {
            max: AtomicUsize::new(usize::MAX),
            written: AtomicUsize::new(0),
            reached: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }
}

impl LengthLimit {
    pub fn set_max(&self, bytes: usize) {
        self.max.store(bytes, Ordering::SeqCst);
    }

    pub fn set_cancel_token(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    /// Accounts `len` bytes; returns `false` once the maximum is exceeded.
    ///
    /// The cancel token fires on the first rejected write only.
    pub fn admit(&self, len: usize) -> bool {
        let total = self
            .written
            .fetch_add(len, Ordering::SeqCst)
            .saturating_add(len);
        if total <= self.max.load(Ordering::SeqCst) {
            return true;
        }

        if !self.reached.swap(true, Ordering::SeqCst) {
            tracing::debug!(written = total, "log writer reached max length");
            if let Some(token) = self.cancel.lock().as_ref() {
                token.cancel();
            }
        }
        false
    }

    #[must_use]
    pub fn reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_limit_within_max() {
        let limit = LengthLimit::default();
        limit.set_max(10);
        assert!(limit.admit(4));
        assert!(limit.admit(6));
        assert!(!limit.reached());
        assert_eq!(limit.written(), 10);
    }

    #[test]
    fn test_length_limit_cancels_once() {
        let limit = LengthLimit::default();
        let token = CancellationToken::new();
        limit.set_max(5);
        limit.set_cancel_token(token.clone());

        assert!(!limit.admit(6));
        assert!(limit.reached());
        assert!(token.is_cancelled());
        assert!(!limit.admit(1));
    }

    #[tokio::test]
    async fn test_silence_timer_fires_after_reset() {
        let timer = SilenceTimer::new(Duration::from_millis(30));
        timer.reset();
        let fired = tokio::time::timeout(Duration::from_secs(1), timer.fired()).await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn test_silence_timer_reset_postpones() {
        let timer = Arc::new(SilenceTimer::new(Duration::from_millis(150)));
        timer.reset();

        let waiter = {
            let timer = Arc::clone(&timer);
            tokio::spawn(async move {
                let started = Instant::now();
                timer.fired().await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.reset();

        let elapsed = waiter.await.unwrap();
        assert!(elapsed >= Duration::from_millis(240));
    }

    #[tokio::test]
    async fn test_silence_timer_stopped_never_fires() {
        let timer = SilenceTimer::new(Duration::from_millis(10));
        timer.reset();
        timer.stop();
        let fired = tokio::time::timeout(Duration::from_millis(100), timer.fired()).await;
        assert!(fired.is_err());
    }
}
