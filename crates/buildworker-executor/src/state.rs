//! State shared by the steps of a single job run.

use std::sync::Arc;
use std::time::Duration;

use buildworker_core::{
    CancellationSubscription, FinishState, Instance, Job, LogWriter, LogWriterFactory, RunResult,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutorError, ExecutorErrorKind};

/// Everything one job run reads and writes.
///
/// Owned by the task driving the pipeline; steps get it by `&mut`.
pub struct JobState {
    pub job: Box<dyn Job>,
    /// Cancelled when the processor terminates.
    pub token: CancellationToken,
    pub hard_timeout: Duration,
    pub log_timeout: Duration,
    pub hostname: String,
    pub infra: String,
    pub processed_at: DateTime<Utc>,
    pub log_writer_factory: Option<Arc<dyn LogWriterFactory>>,

    pub cancellation: Option<CancellationSubscription>,
    pub log_writer: Option<Arc<dyn LogWriter>>,
    pub instance: Option<Arc<dyn Instance>>,
    pub script: Option<Vec<u8>>,
    pub script_result: Option<RunResult>,
    pub error: Option<ExecutorError>,
    /// Leave the instance running after the run.
    pub skip_shutdown: bool,
}

impl JobState {
    #[must_use]
    pub fn new(job: Box<dyn Job>, token: CancellationToken) -> Self {
        let hard_timeout = job.start_attributes().hard_timeout;
        Self {
            job,
            token,
            hard_timeout,
            log_timeout: Duration::from_secs(600),
            hostname: String::new(),
            infra: String::new(),
            processed_at: Utc::now(),
            log_writer_factory: None,
            cancellation: None,
            log_writer: None,
            instance: None,
            script: None,
            script_result: None,
            error: None,
            skip_shutdown: false,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, hard_timeout: Duration, log_timeout: Duration) -> Self {
        self.hard_timeout = hard_timeout;
        self.log_timeout = log_timeout;
        self
    }

    #[must_use]
    pub fn with_host(mut self, hostname: impl Into<String>, infra: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self.infra = infra.into();
        self
    }

    #[must_use]
    pub fn with_log_writer_factory(mut self, factory: Option<Arc<dyn LogWriterFactory>>) -> Self {
        self.log_writer_factory = factory;
        self
    }

    #[must_use]
    pub fn job_id(&self) -> u64 {
        self.job.payload().job.id
    }

    pub fn set_error(&mut self, error: impl Into<ExecutorError>) {
        self.error = Some(error.into());
    }

    /// Terminal state the job ended in, if any.
    #[must_use]
    pub fn finish_state(&self) -> Option<FinishState> {
        self.job.finish_state()
    }

    /// Log writer or a `MissingState` error.
    ///
    /// # Errors
    ///
    /// Fails when no log writer was opened yet.
    pub fn require_log_writer(&self) -> Result<Arc<dyn LogWriter>, ExecutorError> {
        self.log_writer
            .clone()
            .ok_or_else(|| ExecutorErrorKind::MissingState("log writer").into())
    }

    /// Instance or a `MissingState` error.
    ///
    /// # Errors
    ///
    /// Fails when no instance was started.
    pub fn require_instance(&self) -> Result<Arc<dyn Instance>, ExecutorError> {
        self.instance
            .clone()
            .ok_or_else(|| ExecutorErrorKind::MissingState("instance").into())
    }
}

impl std::fmt::Debug for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobState")
            .field("job_id", &self.job_id())
            .field("hard_timeout", &self.hard_timeout)
            .field("log_timeout", &self.log_timeout)
            .field("has_log_writer", &self.log_writer.is_some())
            .field("has_instance", &self.instance.is_some())
            .field("script_result", &self.script_result)
            .field("error", &self.error)
            .field("skip_shutdown", &self.skip_shutdown)
            .finish_non_exhaustive()
    }
}
