//! Buffered log writer publishing fixed-size chunks.
//!
//! Writes only append to a byte buffer. A background tick drains the buffer
//! into parts of at most [`LOG_CHUNK_SIZE`] bytes; close drains it once more
//! and publishes the final part.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{
    Job, JobStartedMeta, LengthLimit, LogWriter, LogWriterError, LogWriterErrorKind,
    LogWriterFactory, SilenceTimer,
};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::part::{LOG_CHUNK_SIZE, LogPart};
use crate::transport::LogPartTransport;

/// Default flush cadence of buffered writers.
pub const LOG_WRITER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Pending {
    bytes: Vec<u8>,
    next_number: u64,
}

struct BufferedInner {
    job_id: u64,
    uuid: String,
    chunk_size: usize,
    transport: Arc<dyn LogPartTransport>,
    pending: Mutex<Pending>,
    started_meta: parking_lot::Mutex<Option<JobStartedMeta>>,
    closed: AtomicBool,
    stop_flushing: CancellationToken,
    limit: LengthLimit,
    timer: SilenceTimer,
}

/// Writer buffering output and publishing it in chunks.
#[derive(Clone)]
pub struct BufferedLogWriter {
    inner: Arc<BufferedInner>,
}

impl std::fmt::Debug for BufferedLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedLogWriter")
            .field("job_id", &self.inner.job_id)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BufferedLogWriter {
    /// Creates the writer and starts its flush task.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn LogPartTransport>,
        job_id: u64,
        uuid: impl Into<String>,
        timeout: Duration,
        tick: Duration,
    ) -> Self {
        let inner = Arc::new(BufferedInner {
            job_id,
            uuid: uuid.into(),
            chunk_size: LOG_CHUNK_SIZE,
            transport,
            pending: Mutex::new(Pending::default()),
            started_meta: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            stop_flushing: CancellationToken::new(),
            limit: LengthLimit::default(),
            timer: SilenceTimer::new(timeout),
        });

        tracing::debug!(job_id, "created buffered log writer");
        tokio::spawn(flush_regularly(Arc::clone(&inner), tick));
        Self { inner }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl BufferedInner {
    fn tag(&self, part: LogPart) -> LogPart {
        let part = part.with_uuid(self.uuid.clone());
        match self.started_meta.lock().take() {
            Some(meta) => LogPart {
                meta: Some(meta),
                ..part
            },
            None => part,
        }
    }

    /// Publishes buffered bytes. Failed chunks are logged and dropped.
    async fn flush(&self, pending: &mut Pending) {
        while !pending.bytes.is_empty() {
            let take = pending.bytes.len().min(self.chunk_size);
            let chunk: Vec<u8> = pending.bytes.drain(..take).collect();
            let part = self.tag(LogPart::content(self.job_id, pending.next_number, chunk));
            pending.next_number += 1;

            if let Err(err) = self.transport.publish(std::slice::from_ref(&part)).await {
                tracing::error!(job_id = self.job_id, number = part.number, error = %err, "couldn't publish log part");
            }
        }
    }

    async fn finish(&self, trailing: &[u8]) -> Result<(), LogWriterError> {
        self.timer.stop();
        self.stop_flushing.cancel();

        let mut pending = self.pending.lock().await;
        pending.bytes.extend_from_slice(trailing);
        self.flush(&mut pending).await;

        let part = self.tag(LogPart::final_part(self.job_id, pending.next_number));
        pending.next_number += 1;
        self.transport
            .publish(std::slice::from_ref(&part))
            .await
            .map_err(|err| LogWriterError::transport(err.to_string()))
    }
}

async fn flush_regularly(inner: Arc<BufferedInner>, tick: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.stop_flushing.cancelled() => return,
            _ = ticker.tick() => {
                let mut pending = inner.pending.lock().await;
                inner.flush(&mut pending).await;
            }
        }
    }
}

#[async_trait]
impl LogWriter for BufferedLogWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        if self.is_closed() {
            return Err(LogWriterErrorKind::Closed.into());
        }

        self.inner.timer.reset();
        if !self.inner.limit.admit(buf.len()) {
            tracing::info!(job_id = self.inner.job_id, "wrote past maximum log length");
            return Ok(0);
        }

        self.inner.pending.lock().await.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&self) -> Result<(), LogWriterError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.finish(&[]).await
    }

    async fn write_and_close(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(job_id = self.inner.job_id, "log already closed");
            return Ok(0);
        }
        self.inner.finish(buf).await?;
        Ok(buf.len())
    }

    async fn timed_out(&self) {
        self.inner.timer.fired().await;
    }

    fn set_max_log_length(&self, bytes: usize) {
        self.inner.limit.set_max(bytes);
    }

    fn set_job_started(&self, meta: JobStartedMeta) {
        *self.inner.started_meta.lock() = Some(meta);
    }

    fn set_cancel_token(&self, token: CancellationToken) {
        self.inner.limit.set_cancel_token(token);
    }

    fn max_length_reached(&self) -> bool {
        self.inner.limit.reached()
    }
}

/// Hands out [`BufferedLogWriter`]s publishing through one transport.
#[derive(Clone)]
pub struct BufferedLogWriterFactory {
    transport: Arc<dyn LogPartTransport>,
    tick: Duration,
}

impl BufferedLogWriterFactory {
    #[must_use]
    pub fn new(transport: Arc<dyn LogPartTransport>) -> Self {
        Self {
            transport,
            tick: LOG_WRITER_TICK,
        }
    }

    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

#[async_trait]
impl LogWriterFactory for BufferedLogWriterFactory {
    async fn log_writer(
        &self,
        default_timeout: Duration,
        job: &dyn Job,
    ) -> Result<Arc<dyn LogWriter>, LogWriterError> {
        let payload = job.payload();
        let timeout = payload.timeouts.log_silence().unwrap_or(default_timeout);

        Ok(Arc::new(BufferedLogWriter::spawn(
            Arc::clone(&self.transport),
            payload.job.id,
            payload.uuid.clone(),
            timeout,
            self.tick,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn writer(tick: Duration) -> (Arc<RecordingTransport>, BufferedLogWriter) {
        let transport = Arc::new(RecordingTransport::default());
        let writer =
            BufferedLogWriter::spawn(transport.clone(), 11, "uuid-1", Duration::from_secs(60), tick);
        (transport, writer)
    }

    #[rstest]
    #[case::short(10, vec![10])]
    #[case::one_chunk(LOG_CHUNK_SIZE, vec![LOG_CHUNK_SIZE])]
    #[case::spills(LOG_CHUNK_SIZE + 1, vec![LOG_CHUNK_SIZE, 1])]
    #[case::several(LOG_CHUNK_SIZE * 2 + 10, vec![LOG_CHUNK_SIZE, LOG_CHUNK_SIZE, 10])]
    #[tokio::test]
    async fn test_close_chunks_and_finalizes(#[case] len: usize, #[case] chunks: Vec<usize>) {
        let (transport, writer) = writer(Duration::from_secs(3600));
        let content = vec![b'x'; len];

        writer.write(&content).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        let parts = transport.parts();
        let sizes: Vec<usize> = parts.iter().map(|p| p.content.len()).collect();
        let mut expected = chunks.clone();
        expected.push(0);
        assert_eq!(sizes, expected);
        let numbers: Vec<u64> = parts.iter().map(|p| p.number).collect();
        assert_eq!(numbers, (0..=chunks.len() as u64).collect::<Vec<_>>());
        assert!(parts[chunks.len()].is_final);
        assert!(parts.iter().all(|p| p.uuid == "uuid-1"));
    }

    #[tokio::test]
    async fn test_periodic_flush_without_close() {
        let (transport, writer) = writer(Duration::from_millis(20));
        writer.write(b"tail me").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let parts = transport.parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, b"tail me".to_vec());
        assert!(!parts[0].is_final);
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_job_started_meta_on_next_part_only() {
        let (transport, writer) = writer(Duration::from_secs(3600));
        writer.set_job_started(JobStartedMeta {
            repo: "octo/hello".to_string(),
            ..JobStartedMeta::default()
        });

        writer.write_and_close(b"started").await.unwrap();
        let parts = transport.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].meta.as_ref().map(|m| m.repo.as_str()), Some("octo/hello"));
        assert!(parts[1].meta.is_none());
    }

    #[tokio::test]
    async fn test_max_length() {
        let (transport, writer) = writer(Duration::from_secs(3600));
        let token = CancellationToken::new();
        writer.set_max_log_length(4);
        writer.set_cancel_token(token.clone());

        assert_eq!(writer.write(b"1234").await.unwrap(), 4);
        assert_eq!(writer.write(b"5").await.unwrap(), 0);
        assert!(writer.max_length_reached());
        assert!(token.is_cancelled());

        writer.close().await.unwrap();
        assert_eq!(transport.parts()[0].content, b"1234".to_vec());
    }
}
