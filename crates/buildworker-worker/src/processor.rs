//! A processor pulls jobs off its stream and runs them one at a time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use buildworker_core::{FinishState, Job, LogWriterFactory, QueueError, WorkerConfig};
use buildworker_executor::{JobState, Pipeline};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, field, info, info_span};
use uuid::Uuid;

use crate::queue::{JobQueue, JobStream};

/// How long an idle processor waits before logging that it is still idle.
const IDLE_TICK: Duration = Duration::from_secs(10);

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorStatus {
    /// Created, not running yet.
    New,
    /// Waiting for a job.
    Waiting,
    /// Running a job.
    Processing,
    /// Stopped.
    Done,
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Done => "done",
        })
    }
}

/// Point-in-time view of a processor for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorInfo {
    /// Processor id.
    pub id: String,
    /// Current status.
    pub status: ProcessorStatus,
    /// Jobs run so far.
    pub processed: usize,
    /// Id of the most recent job, if any.
    pub last_job_id: Option<u64>,
}

/// Unique processor id, `{uuid}@{pid}.{hostname}`.
#[must_use]
pub fn processor_id(hostname: &str) -> String {
    format!("{}@{}.{hostname}", Uuid::new_v4(), std::process::id())
}

/// Runs jobs from one stream through the pipeline.
///
/// Graceful shutdown lets the current job finish; terminate cancels it.
pub struct Processor {
    id: String,
    config: Arc<WorkerConfig>,
    pipeline: Arc<Pipeline>,
    stream: JobStream,
    log_writer_factory: Option<Arc<dyn LogWriterFactory>>,
    graceful: CancellationToken,
    terminate: CancellationToken,
    status: Mutex<ProcessorStatus>,
    processed: AtomicUsize,
    last_job_id: Mutex<Option<u64>>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("processed", &self.processed())
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Opens a stream on `queue` and prepares to run jobs from it.
    ///
    /// The processor terminates when `parent` is cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the queue cannot open a stream.
    pub async fn new(
        id: impl Into<String>,
        config: Arc<WorkerConfig>,
        pipeline: Arc<Pipeline>,
        queue: &dyn JobQueue,
        log_writer_factory: Option<Arc<dyn LogWriterFactory>>,
        parent: &CancellationToken,
    ) -> Result<Self, QueueError> {
        let terminate = parent.child_token();
        let stream = queue.jobs(terminate.clone()).await?;

        Ok(Self {
            id: id.into(),
            config,
            pipeline,
            stream,
            log_writer_factory,
            graceful: CancellationToken::new(),
            terminate,
            status: Mutex::new(ProcessorStatus::New),
            processed: AtomicUsize::new(0),
            last_job_id: Mutex::new(None),
        })
    }

    /// Processor id, `{uuid}@{pid}.{hostname}`.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProcessorStatus {
        *self.status.lock()
    }

    /// Number of jobs this processor has run, whatever their outcome.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Point-in-time status for reporting.
    #[must_use]
    pub fn status_snapshot(&self) -> ProcessorInfo {
        ProcessorInfo {
            id: self.id.clone(),
            status: self.status(),
            processed: self.processed(),
            last_job_id: *self.last_job_id.lock(),
        }
    }

    /// Stops taking new jobs. The current job, if any, runs to completion.
    pub fn graceful_shutdown(&self) {
        if self.graceful.is_cancelled() {
            debug!(processor = %self.id, "graceful shutdown already requested");
            return;
        }
        info!(processor = %self.id, "processor initiating graceful shutdown");
        self.graceful.cancel();
    }

    /// Stops right away, cancelling the current job.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    fn set_status(&self, status: ProcessorStatus) {
        *self.status.lock() = status;
    }

    /// Takes jobs until the stream ends or a shutdown is requested.
    ///
    /// Pending shutdown requests win over waiting jobs.
    pub async fn run(&self) {
        info!(processor = %self.id, "starting processor");
        self.set_status(ProcessorStatus::Waiting);

        loop {
            if self.terminate.is_cancelled() {
                info!(processor = %self.id, "processor is done, terminating");
                break;
            }
            if self.graceful.is_cancelled() {
                info!(processor = %self.id, "processor is done, shutting down");
                self.terminate.cancel();
                break;
            }

            tokio::select! {
                biased;
                () = self.terminate.cancelled() => {}
                () = self.graceful.cancelled() => {}
                job = self.stream.next() => match job {
                    Some(job) => self.process(job).await,
                    None => {
                        info!(processor = %self.id, "job stream closed, terminating");
                        self.terminate.cancel();
                    }
                },
                () = tokio::time::sleep(IDLE_TICK) => {
                    debug!(processor = %self.id, "timeout waiting for job, shutdown or cancellation");
                }
            }
        }

        self.set_status(ProcessorStatus::Done);
        info!(processor = %self.id, processed = self.processed(), "processor stopped");
    }

    async fn process(&self, mut job: Box<dyn Job>) {
        let timeouts = job.payload().timeouts;
        let hard_timeout = self.config.hard_timeout_for(timeouts.hard_limit());
        let log_timeout = self.config.log_timeout_for(timeouts.log_silence());
        {
            let attrs = job.start_attributes_mut();
            attrs.progress_type.clone_from(&self.config.progress_type);
            attrs.hard_timeout = hard_timeout;
        }

        let payload = job.payload();
        let job_id = payload.job.id;
        let uuid = if payload.uuid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            payload.uuid.clone()
        };
        let span = info_span!(
            "job",
            processor = %self.id,
            job_id,
            repository = %payload.repository.slug,
            uuid = %uuid,
            instance_id = field::Empty,
        );

        *self.last_job_id.lock() = Some(job_id);
        self.set_status(ProcessorStatus::Processing);

        let mut state = JobState::new(job, self.terminate.clone())
            .with_timeouts(hard_timeout, log_timeout)
            .with_host(self.id.clone(), self.config.infra.clone())
            .with_log_writer_factory(self.log_writer_factory.clone());

        async {
            info!(?hard_timeout, ?log_timeout, "starting job");
            self.pipeline.run(&mut state).await;

            let (instance_id, image_name) = state
                .instance
                .as_ref()
                .map(|i| (i.id(), i.image_name()))
                .unwrap_or_default();
            info!(
                instance_id = %instance_id,
                image_name = %image_name,
                error = %state.error.as_ref().map_or_else(String::new, ToString::to_string),
                state = state.finish_state().map_or("none", FinishState::as_str),
                requeued = state.job.requeued(),
                "finished job"
            );
        }
        .instrument(span)
        .await;

        self.processed.fetch_add(1, Ordering::SeqCst);
        self.set_status(ProcessorStatus::Waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ChannelJobQueue;
    use buildworker_core::testing::{FakeBackendConfig, FakeJob, FakeProvider, StaticScriptGenerator};
    use buildworker_core::CancellationBroadcaster;
    use buildworker_executor::{PipelineDeps, job_pipeline};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    async fn processor(queue: &ChannelJobQueue) -> Processor {
        let config = Arc::new(WorkerConfig::default().with_initial_sleep(Duration::ZERO));
        let deps = PipelineDeps {
            provider: Arc::new(FakeProvider::new(FakeBackendConfig::default())),
            generator: Arc::new(StaticScriptGenerator::new("echo hi")),
            persister: None,
            broadcaster: CancellationBroadcaster::new(),
        };
        let pipeline = Arc::new(job_pipeline(&deps, &config));
        Processor::new(
            processor_id("test-host"),
            config,
            pipeline,
            queue,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_processor_id_format() {
        let id = processor_id("box.local");
        let (uuid, rest) = id.split_once('@').unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
        assert_eq!(rest, format!("{}.box.local", std::process::id()));
    }

    #[tokio::test]
    async fn test_runs_jobs_until_stream_closes() {
        let (queue, sender) = ChannelJobQueue::new(2);
        let processor = processor(&queue).await;
        assert_eq!(processor.status(), ProcessorStatus::New);

        let job = FakeJob::new(11);
        let events = job.events();
        sender.send(Box::new(job)).await.unwrap();
        drop(sender);

        processor.run().await;

        assert_eq!(events.snapshot(), vec!["received", "started", "passed"]);
        let info = processor.status_snapshot();
        assert_eq!(info.status, ProcessorStatus::Done);
        assert_eq!(info.processed, 1);
        assert_eq!(info.last_job_id, Some(11));
    }

    #[tokio::test]
    async fn test_pending_graceful_shutdown_wins_over_queued_job() {
        let (queue, sender) = ChannelJobQueue::new(1);
        let processor = processor(&queue).await;

        let job = FakeJob::new(3);
        let events = job.events();
        sender.send(Box::new(job)).await.unwrap();
        processor.graceful_shutdown();
        processor.graceful_shutdown();

        processor.run().await;
        assert!(events.snapshot().is_empty());
        assert_eq!(processor.processed(), 0);
    }

    #[rstest]
    #[case(ProcessorStatus::New, "new")]
    #[case(ProcessorStatus::Waiting, "waiting")]
    #[case(ProcessorStatus::Processing, "processing")]
    #[case(ProcessorStatus::Done, "done")]
    fn test_status_display_matches_serde(#[case] status: ProcessorStatus, #[case] expected: &str) {
        assert_eq!(status.to_string(), expected);
        assert_eq!(serde_json::to_value(status).unwrap(), expected);
    }
}
