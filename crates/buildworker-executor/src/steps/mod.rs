//! Steps of the standard job pipeline.
//!
//! [`job_pipeline`] assembles them in execution order:
//!
//! subscribe cancellation, transform payload, generate script, send
//! received, initial sleep, open log writer, start instance, upload script,
//! update state, write worker info, run script, download trace. A
//! cancellation check runs between the stages that talk to the outside.

mod check_cancellation;
mod download_trace;
mod generate_script;
mod open_log_writer;
mod run_script;
mod send_received;
mod sleep;
mod start_instance;
mod subscribe_cancellation;
mod transform_payload;
mod update_state;
mod upload_script;
mod write_worker_info;

use std::sync::Arc;

use buildworker_core::{
    BackoffPolicy, BuildScriptGenerator, BuildTracePersister, CancellationBroadcaster,
    FinishState, LogWriter, Provider, WorkerConfig,
};
use tracing::error;

use crate::pipeline::{Pipeline, Step};
use crate::state::JobState;

pub use check_cancellation::CheckCancellation;
pub use download_trace::DownloadTrace;
pub use generate_script::GenerateScript;
pub use open_log_writer::OpenLogWriter;
pub use run_script::RunScript;
pub use send_received::SendReceived;
pub use sleep::Sleep;
pub use start_instance::StartInstance;
pub use subscribe_cancellation::SubscribeCancellation;
pub use transform_payload::TransformPayload;
pub use update_state::UpdateState;
pub use upload_script::UploadScript;
pub use write_worker_info::WriteWorkerInfo;

/// Collaborators shared by every pipeline a pool runs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub provider: Arc<dyn Provider>,
    pub generator: Arc<dyn BuildScriptGenerator>,
    pub persister: Option<Arc<dyn BuildTracePersister>>,
    pub broadcaster: CancellationBroadcaster,
}

impl std::fmt::Debug for PipelineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDeps")
            .field("has_persister", &self.persister.is_some())
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

/// Builds the standard job pipeline.
#[must_use]
pub fn job_pipeline(deps: &PipelineDeps, config: &WorkerConfig) -> Pipeline {
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(SubscribeCancellation::new(deps.broadcaster.clone())),
        Box::new(TransformPayload::new(config.payload_filter_executable.clone())),
        Box::new(GenerateScript::new(
            Arc::clone(&deps.generator),
            BackoffPolicy::script_generation(),
        )),
        Box::new(SendReceived),
        Box::new(Sleep::new(config.initial_sleep)),
        Box::new(CheckCancellation),
        Box::new(OpenLogWriter::new(config.max_log_length)),
        Box::new(CheckCancellation),
        Box::new(StartInstance::new(
            Arc::clone(&deps.provider),
            config.startup_timeout,
        )),
        Box::new(CheckCancellation),
        Box::new(UploadScript::new(
            config.script_upload_timeout,
            deps.provider.supports_progress(),
        )),
        Box::new(CheckCancellation),
        Box::new(UpdateState),
        Box::new(WriteWorkerInfo),
        Box::new(CheckCancellation),
        Box::new(RunScript::new(config.skip_shutdown_on_log_timeout)),
        Box::new(DownloadTrace::new(
            deps.persister
                .clone()
                .filter(|_| config.build_trace_enabled),
        )),
    ];
    Pipeline::new(steps)
}

/// Writes a closing message to the job log and finishes the job.
///
/// Failures are logged; the job is finished even when the message could
/// not be written.
pub(crate) async fn write_log_and_finish(
    state: &mut JobState,
    writer: &dyn LogWriter,
    finish: FinishState,
    message: &str,
) {
    if let Err(err) = writer.write_and_close(message.as_bytes()).await {
        error!(error = %err, "couldn't write final log message");
    }
    finish_job(state, finish).await;
}

pub(crate) async fn finish_job(state: &mut JobState, finish: FinishState) {
    if let Err(err) = state.job.finish(finish).await {
        error!(error = %err, state = %finish, "couldn't update job state");
    }
}

pub(crate) async fn requeue_job(state: &mut JobState) {
    if let Err(err) = state.job.requeue().await {
        error!(error = %err, "couldn't requeue job");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use buildworker_core::testing::{FakeBackendConfig, FakeJob, FakeProvider, RecordingLogWriter};
    use buildworker_core::{Provider, StartAttributes};
    use tokio_util::sync::CancellationToken;

    use crate::state::JobState;

    pub(crate) fn state_for(job: FakeJob) -> JobState {
        JobState::new(Box::new(job), CancellationToken::new())
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(60))
            .with_host("worker-1.local", "test")
    }

    /// State with an open log writer and a started fake instance.
    pub(crate) async fn running_state(
        job: FakeJob,
        backend: FakeBackendConfig,
    ) -> (JobState, Arc<RecordingLogWriter>, FakeProvider) {
        let log = job.log();
        let provider = FakeProvider::new(backend);
        let mut state = state_for(job);
        state.log_writer = Some(log.clone());
        state.instance = Some(
            provider
                .start(&CancellationToken::new(), &StartAttributes::default())
                .await
                .unwrap(),
        );
        (state, log, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildworker_core::testing::{FakeProvider, StaticScriptGenerator};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_standard_pipeline_order() {
        let deps = PipelineDeps {
            provider: Arc::new(FakeProvider::default()),
            generator: Arc::new(StaticScriptGenerator::new("echo hi")),
            persister: None,
            broadcaster: CancellationBroadcaster::new(),
        };
        let pipeline = job_pipeline(&deps, &WorkerConfig::default());

        assert_eq!(
            pipeline.step_names(),
            vec![
                "subscribe_cancellation",
                "transform_payload",
                "generate_script",
                "send_received",
                "sleep",
                "check_cancellation",
                "open_log_writer",
                "check_cancellation",
                "start_instance",
                "check_cancellation",
                "upload_script",
                "check_cancellation",
                "update_state",
                "write_worker_info",
                "check_cancellation",
                "run_script",
                "download_trace",
            ]
        );
    }
}
