//! Job queues and the streams processors pull from.
//!
//! Streams are pull-based: a job leaves its source only when a processor
//! asks for the next one, so dropping a pending `next` never loses a job.

use std::sync::Arc;

use async_trait::async_trait;
use buildworker_core::{Job, QueueError};
use futures::future::select_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something that hands out jobs one at a time.
///
/// `next_job` must be cancel-safe. `None` means the source is exhausted.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn next_job(&self) -> Option<Box<dyn Job>>;
}

/// A view of a [`JobSource`] that ends when its token is cancelled.
#[derive(Clone)]
pub struct JobStream {
    source: Arc<dyn JobSource>,
    token: CancellationToken,
}

impl JobStream {
    #[must_use]
    pub fn new(source: Arc<dyn JobSource>, token: CancellationToken) -> Self {
        Self { source, token }
    }

    /// Bounded channel stream. The stream ends once every sender is dropped.
    #[must_use]
    pub fn channel(capacity: usize, token: CancellationToken) -> (JobSender, Self) {
        let (sender, source) = channel_source(capacity);
        (sender, Self::new(source, token))
    }

    /// Waits for the next job. Returns `None` when the source is exhausted
    /// or the token was cancelled.
    pub async fn next(&self) -> Option<Box<dyn Job>> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            job = self.source.next_job() => job,
        }
    }
}

impl std::fmt::Debug for JobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStream")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Sending half of a channel-backed source.
pub type JobSender = mpsc::Sender<Box<dyn Job>>;

struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>,
}

#[async_trait]
impl JobSource for ChannelSource {
    async fn next_job(&self) -> Option<Box<dyn Job>> {
        self.rx.lock().await.recv().await
    }
}

pub(crate) fn channel_source(capacity: usize) -> (JobSender, Arc<dyn JobSource>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let source = ChannelSource {
        rx: tokio::sync::Mutex::new(rx),
    };
    (tx, Arc::new(source))
}

/// A source of build jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Opens a stream of jobs bound to `token`.
    ///
    /// Each processor asks for its own stream. Streams of the same queue
    /// may share one underlying source.
    ///
    /// # Errors
    ///
    /// Fails when the queue cannot deliver jobs.
    async fn jobs(&self, token: CancellationToken) -> Result<JobStream, QueueError>;

    fn name(&self) -> String;

    /// Releases resources held by the queue.
    ///
    /// # Errors
    ///
    /// Fails when the queue could not shut down cleanly.
    async fn cleanup(&self) -> Result<(), QueueError>;
}

/// In-process queue fed through a [`JobSender`].
pub struct ChannelJobQueue {
    source: Arc<dyn JobSource>,
}

impl ChannelJobQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, JobSender) {
        let (sender, source) = channel_source(capacity);
        (Self { source }, sender)
    }
}

impl std::fmt::Debug for ChannelJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelJobQueue").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn jobs(&self, token: CancellationToken) -> Result<JobStream, QueueError> {
        Ok(JobStream::new(Arc::clone(&self.source), token))
    }

    fn name(&self) -> String {
        "channel".to_string()
    }

    async fn cleanup(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Merges several queues into one.
///
/// Whichever source has a job first wins; exhausted sources drop out and
/// the merged stream ends when all of them did.
pub struct MultiSourceJobQueue {
    queues: Vec<Arc<dyn JobQueue>>,
}

impl MultiSourceJobQueue {
    #[must_use]
    pub fn new(queues: Vec<Arc<dyn JobQueue>>) -> Self {
        Self { queues }
    }
}

impl std::fmt::Debug for MultiSourceJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSourceJobQueue")
            .field("name", &self.name())
            .finish()
    }
}

struct MergedSource {
    streams: Vec<JobStream>,
}

#[async_trait]
impl JobSource for MergedSource {
    async fn next_job(&self) -> Option<Box<dyn Job>> {
        let mut pending: Vec<_> = self.streams.iter().map(|s| Box::pin(s.next())).collect();
        while !pending.is_empty() {
            let (job, _, rest) = select_all(pending).await;
            if job.is_some() {
                return job;
            }
            pending = rest;
        }
        None
    }
}

#[async_trait]
impl JobQueue for MultiSourceJobQueue {
    async fn jobs(&self, token: CancellationToken) -> Result<JobStream, QueueError> {
        let mut streams = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            streams.push(queue.jobs(token.clone()).await?);
        }
        Ok(JobStream::new(Arc::new(MergedSource { streams }), token))
    }

    fn name(&self) -> String {
        self.queues
            .iter()
            .map(|q| q.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Cleans up every source and reports the first failure.
    async fn cleanup(&self) -> Result<(), QueueError> {
        let mut first = None;
        for queue in &self.queues {
            if let Err(err) = queue.cleanup().await {
                tracing::error!(queue = %queue.name(), error = %err, "queue cleanup failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildworker_core::testing::FakeJob;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ids(jobs: &[Box<dyn Job>]) -> Vec<u64> {
        let mut ids: Vec<u64> = jobs.iter().map(|j| j.payload().job.id).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn test_channel_queue_delivers_in_order() {
        let (queue, sender) = ChannelJobQueue::new(4);
        let stream = queue.jobs(CancellationToken::new()).await.unwrap();

        sender.send(Box::new(FakeJob::new(1))).await.unwrap();
        sender.send(Box::new(FakeJob::new(2))).await.unwrap();
        drop(sender);

        assert_eq!(stream.next().await.unwrap().payload().job.id, 1);
        assert_eq!(stream.next().await.unwrap().payload().job.id, 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_on_cancel() {
        let (queue, _sender) = ChannelJobQueue::new(1);
        let token = CancellationToken::new();
        let stream = queue.jobs(token.clone()).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_source_merges_and_ends_when_all_close() {
        let (a, tx_a) = ChannelJobQueue::new(2);
        let (b, tx_b) = ChannelJobQueue::new(2);
        let multi = MultiSourceJobQueue::new(vec![Arc::new(a), Arc::new(b)]);
        assert_eq!(multi.name(), "channel,channel");

        tx_a.send(Box::new(FakeJob::new(1))).await.unwrap();
        tx_b.send(Box::new(FakeJob::new(2))).await.unwrap();
        drop(tx_a);

        let stream = multi.jobs(CancellationToken::new()).await.unwrap();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(ids(&[first, second]), vec![1, 2]);

        tx_b.send(Box::new(FakeJob::new(3))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().payload().job.id, 3);

        drop(tx_b);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_multi_source_does_not_strand_jobs() {
        let (a, tx_a) = ChannelJobQueue::new(1);
        let (b, tx_b) = ChannelJobQueue::new(1);
        let multi = MultiSourceJobQueue::new(vec![Arc::new(a), Arc::new(b)]);
        let stream = multi.jobs(CancellationToken::new()).await.unwrap();

        tx_b.send(Box::new(FakeJob::new(7))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().payload().job.id, 7);

        // The losing source must still hold its job for the next pull.
        tx_a.send(Box::new(FakeJob::new(8))).await.unwrap();
        tx_b.send(Box::new(FakeJob::new(9))).await.unwrap();
        let a = stream.next().await.unwrap();
        let b = stream.next().await.unwrap();
        assert_eq!(ids(&[a, b]), vec![8, 9]);
    }
}
