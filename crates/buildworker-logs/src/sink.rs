//! Bounded log part sink.
//!
//! Writers push parts with [`LogSink::add`]; a background task publishes the
//! whole buffer on every tick or as soon as it passes 90% of capacity.
//! Failed batches go back to the front of the buffer, so a dead transport
//! fills the sink and `add` starts failing. A batch being published still
//! counts against the capacity.

use std::sync::Arc;
use std::time::Duration;

use buildworker_core::{BackoffPolicy, LogWriterError, LogWriterErrorKind, retry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::part::LogPart;
use crate::transport::{LogPartTransport, TransportError};

/// Sink sizing and flush cadence.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Maximum number of buffered parts.
    pub max_buffer_size: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_interval: Duration,
    pub retry: BackoffPolicy,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 150,
            flush_interval: Duration::from_millis(500),
            retry: BackoffPolicy::log_publish(),
        }
    }
}

struct Buffer {
    parts: Vec<LogPart>,
    /// Parts taken by a flush that has not finished yet.
    in_flight: usize,
}

impl Buffer {
    fn held(&self) -> usize {
        self.parts.len() + self.in_flight
    }
}

struct SinkInner {
    config: LogSinkConfig,
    buffer: Mutex<Buffer>,
    transport: Arc<dyn LogPartTransport>,
    flush_requested: Notify,
    shutdown: CancellationToken,
}

/// Shared buffer in front of one log destination.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("config", &self.inner.config)
            .field("buffered", &self.len())
            .finish_non_exhaustive()
    }
}

impl LogSink {
    /// Creates the sink and starts its flush task. The task publishes what
    /// is left and exits once `shutdown` fires.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn LogPartTransport>,
        config: LogSinkConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let inner = Arc::new(SinkInner {
            config,
            buffer: Mutex::new(Buffer {
                parts: Vec::with_capacity(config.max_buffer_size),
                in_flight: 0,
            }),
            transport,
            flush_requested: Notify::new(),
            shutdown,
        });
        tokio::spawn(flush_regularly(Arc::clone(&inner)));
        Self { inner }
    }

    /// Buffers `part` for the next flush.
    ///
    /// # Errors
    ///
    /// Fails with [`LogWriterErrorKind::SinkFull`] once the sink holds
    /// `max_buffer_size` parts, buffered or being published.
    pub fn add(&self, part: LogPart) -> Result<(), LogWriterError> {
        let max = self.inner.config.max_buffer_size;
        let mut buffer = self.inner.buffer.lock();
        let held = buffer.held();
        if held >= max {
            return Err(LogWriterErrorKind::SinkFull { max }.into());
        }
        buffer.parts.push(part);
        drop(buffer);

        if held + max / 10 >= max {
            self.inner.flush_requested.notify_one();
        }
        Ok(())
    }

    /// Publishes everything buffered right now.
    ///
    /// # Errors
    ///
    /// Returns the transport error after retries; the batch stays buffered.
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.inner.flush().await
    }

    /// Parts waiting for the next flush.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.buffer.lock().parts.len()
    }

    /// Parts buffered plus those in a publish that has not finished.
    #[must_use]
    pub fn held(&self) -> usize {
        self.inner.buffer.lock().held()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn config(&self) -> &LogSinkConfig {
        &self.inner.config
    }
}

impl SinkInner {
    async fn flush(&self) -> Result<(), TransportError> {
        let batch = {
            let mut buffer = self.buffer.lock();
            let batch = std::mem::take(&mut buffer.parts);
            buffer.in_flight += batch.len();
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }

        let transport = &self.transport;
        let parts = &batch;
        let published = retry(
            &self.config.retry,
            &self.shutdown,
            |_: &TransportError| true,
            move || transport.publish(parts),
        )
        .await;

        match published {
            Ok(()) => {
                self.buffer.lock().in_flight -= batch.len();
                tracing::debug!(parts = batch.len(), "flushed log parts");
                Ok(())
            }
            Err(err) => {
                let count = batch.len();
                let mut buffer = self.buffer.lock();
                buffer.in_flight -= count;
                let newer = std::mem::replace(&mut buffer.parts, batch);
                buffer.parts.extend(newer);
                tracing::warn!(parts = count, error = %err, "log part publish failed, batch kept");
                Err(err)
            }
        }
    }
}

async fn flush_regularly(inner: Arc<SinkInner>) {
    let period = inner.config.flush_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let stopping = tokio::select! {
            () = inner.shutdown.cancelled() => true,
            _ = ticker.tick() => false,
            () = inner.flush_requested.notified() => false,
        };

        if let Err(err) = inner.flush().await {
            tracing::error!(error = %err, "failed to flush buffer");
        }
        if stopping {
            tracing::debug!(remaining = inner.buffer.lock().parts.len(), "log sink stopped");
            return;
        }
    }
}
