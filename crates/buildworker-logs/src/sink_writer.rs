//! Log writer feeding a shared [`LogSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{
    Job, JobStartedMeta, LengthLimit, LogWriter, LogWriterError, LogWriterErrorKind,
    LogWriterFactory, SilenceTimer,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::part::LogPart;
use crate::sink::LogSink;

/// Largest content slice sent as a single part.
pub const MAX_PART_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Cursor {
    next_number: u64,
    closed: bool,
}

/// Writer turning each write into numbered parts on a [`LogSink`].
#[derive(Debug)]
pub struct SinkLogWriter {
    job_id: u64,
    token: String,
    sink: LogSink,
    cursor: Mutex<Cursor>,
    limit: LengthLimit,
    timer: SilenceTimer,
}

impl SinkLogWriter {
    #[must_use]
    pub fn new(sink: LogSink, job_id: u64, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            job_id,
            token: token.into(),
            sink,
            cursor: Mutex::new(Cursor::default()),
            limit: LengthLimit::default(),
            timer: SilenceTimer::new(timeout),
        }
    }

    fn part(&self, number: u64, content: &[u8]) -> LogPart {
        LogPart::content(self.job_id, number, content).with_token(self.token.clone())
    }

    fn push_content(&self, cursor: &mut Cursor, buf: &[u8]) -> Result<(), LogWriterError> {
        if buf.is_empty() {
            self.sink.add(self.part(cursor.next_number, buf))?;
            cursor.next_number += 1;
            return Ok(());
        }
        for chunk in buf.chunks(MAX_PART_SIZE) {
            self.sink.add(self.part(cursor.next_number, chunk))?;
            cursor.next_number += 1;
        }
        Ok(())
    }

    fn push_final(&self, cursor: &mut Cursor) -> Result<(), LogWriterError> {
        self.sink.add(
            LogPart::final_part(self.job_id, cursor.next_number).with_token(self.token.clone()),
        )?;
        cursor.next_number += 1;
        Ok(())
    }
}

#[async_trait]
impl LogWriter for SinkLogWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        let mut cursor = self.cursor.lock();
        if cursor.closed {
            return Err(LogWriterErrorKind::Closed.into());
        }

        self.timer.reset();
        if !self.limit.admit(buf.len()) {
            tracing::info!(job_id = self.job_id, "wrote past maximum log length");
            return Ok(0);
        }

        if let Err(err) = self.push_content(&mut cursor, buf) {
            tracing::error!(job_id = self.job_id, error = %err, "could not add log part to sink");
            return Err(err);
        }
        Ok(buf.len())
    }

    async fn close(&self) -> Result<(), LogWriterError> {
        let mut cursor = self.cursor.lock();
        if cursor.closed {
            return Ok(());
        }
        // Stays open when the sink rejects the final part, so close can be retried.
        self.push_final(&mut cursor)?;
        cursor.closed = true;
        self.timer.stop();
        Ok(())
    }

    async fn write_and_close(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        let mut cursor = self.cursor.lock();
        if cursor.closed {
            tracing::debug!(job_id = self.job_id, "log already closed");
            return Ok(0);
        }
        self.push_content(&mut cursor, buf)?;
        self.push_final(&mut cursor)?;
        cursor.closed = true;
        self.timer.stop();
        Ok(buf.len())
    }

    async fn timed_out(&self) {
        self.timer.fired().await;
    }

    fn set_max_log_length(&self, bytes: usize) {
        self.limit.set_max(bytes);
    }

    fn set_job_started(&self, _meta: JobStartedMeta) {}

    fn set_cancel_token(&self, token: CancellationToken) {
        self.limit.set_cancel_token(token);
    }

    fn max_length_reached(&self) -> bool {
        self.limit.reached()
    }
}

/// Hands out [`SinkLogWriter`]s that all share one sink.
#[derive(Debug, Clone)]
pub struct SinkLogWriterFactory {
    sink: LogSink,
    token: String,
}

impl SinkLogWriterFactory {
    #[must_use]
    pub fn new(sink: LogSink, token: impl Into<String>) -> Self {
        Self {
            sink,
            token: token.into(),
        }
    }
}

#[async_trait]
impl LogWriterFactory for SinkLogWriterFactory {
    async fn log_writer(
        &self,
        default_timeout: Duration,
        job: &dyn Job,
    ) -> Result<Arc<dyn LogWriter>, LogWriterError> {
        let timeout = job
            .payload()
            .timeouts
            .log_silence()
            .unwrap_or(default_timeout);

        Ok(Arc::new(SinkLogWriter::new(
            self.sink.clone(),
            job.payload().job.id,
            self.token.clone(),
            timeout,
        )))
    }
}
