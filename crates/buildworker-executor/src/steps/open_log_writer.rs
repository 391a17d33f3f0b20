use async_trait::async_trait;
use buildworker_core::LogWriter;
use tracing::{error, warn};

use crate::error::ExecutorError;
use crate::pipeline::{Step, StepAction};
use crate::state::JobState;
use crate::steps::requeue_job;

/// Opens the job log through the shared factory or the job itself.
#[derive(Debug, Clone, Copy)]
pub struct OpenLogWriter {
    max_log_length: usize,
}

impl OpenLogWriter {
    #[must_use]
    pub fn new(max_log_length: usize) -> Self {
        Self { max_log_length }
    }
}

#[async_trait]
impl Step for OpenLogWriter {
    fn name(&self) -> &'static str {
        "open_log_writer"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let opened = match &state.log_writer_factory {
            Some(factory) => factory
                .log_writer(state.log_timeout, state.job.as_ref())
                .await
                .map_err(ExecutorError::from),
            None => state
                .job
                .log_writer(state.log_timeout)
                .await
                .map_err(ExecutorError::from),
        };

        match opened {
            Ok(writer) => {
                writer.set_max_log_length(self.max_log_length);
                state.log_writer = Some(writer);
                StepAction::Continue
            }
            Err(err) => {
                error!(error = %err, log_timeout = ?state.log_timeout, "couldn't open a log writer, attempting requeue");
                state.set_error(err);
                requeue_job(state).await;
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&self, state: &mut JobState) {
        if let Some(writer) = &state.log_writer
            && let Err(err) = writer.close().await
        {
            warn!(error = %err, "couldn't close log writer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::state_for;
    use async_trait::async_trait;
    use buildworker_core::testing::{FakeJob, RecordingLogWriter};
    use buildworker_core::{Job, LogWriterError, LogWriterFactory};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    struct FailingFactory;

    #[async_trait]
    impl LogWriterFactory for FailingFactory {
        async fn log_writer(
            &self,
            _default_timeout: Duration,
            _job: &dyn Job,
        ) -> Result<Arc<dyn LogWriter>, LogWriterError> {
            Err(LogWriterError::transport("no log destination"))
        }
    }

    struct SharedFactory(Arc<RecordingLogWriter>);

    #[async_trait]
    impl LogWriterFactory for SharedFactory {
        async fn log_writer(
            &self,
            _default_timeout: Duration,
            _job: &dyn Job,
        ) -> Result<Arc<dyn LogWriter>, LogWriterError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_job_log_writer() {
        let job = FakeJob::new(1);
        let log = job.log();
        let mut state = state_for(job);
        let step = OpenLogWriter::new(3);

        assert_eq!(step.run(&mut state).await, StepAction::Continue);
        state.require_log_writer().unwrap().write(b"12345").await.unwrap();
        assert!(log.max_length_reached());

        step.cleanup(&mut state).await;
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn test_prefers_factory() {
        let shared = Arc::new(RecordingLogWriter::new());
        let mut state = state_for(FakeJob::new(1))
            .with_log_writer_factory(Some(Arc::new(SharedFactory(shared.clone()))));

        OpenLogWriter::new(100).run(&mut state).await;
        state.require_log_writer().unwrap().write(b"via factory").await.unwrap();
        assert_eq!(shared.contents(), "via factory");
    }

    #[tokio::test]
    async fn test_failure_requeues() {
        let job = FakeJob::new(1);
        let events = job.events();
        let mut state =
            state_for(job).with_log_writer_factory(Some(Arc::new(FailingFactory)));

        assert_eq!(OpenLogWriter::new(100).run(&mut state).await, StepAction::Halt);
        assert_eq!(events.snapshot(), vec!["requeued"]);
        assert!(state.log_writer.is_none());
        assert!(state.error.is_some());
    }
}
