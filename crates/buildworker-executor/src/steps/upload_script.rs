use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{BackendError, BackendErrorKind};
use tracing::{error, info, warn};

use crate::error::ExecutorErrorKind;
use crate::fold::{write_fold_end, write_fold_start};
use crate::pipeline::{Step, StepAction};
use crate::state::JobState;
use crate::steps::requeue_job;

const FOLD: &str = "step_upload_script";

/// Uploads the generated script to the instance. Failures requeue the job.
#[derive(Debug, Clone, Copy)]
pub struct UploadScript {
    timeout: Duration,
    progress: bool,
}

impl UploadScript {
    #[must_use]
    pub fn new(timeout: Duration, progress: bool) -> Self {
        Self { timeout, progress }
    }

    async fn upload(&self, state: &JobState) -> Result<(), crate::ExecutorError> {
        let instance = state.require_instance()?;
        let script = state
            .script
            .as_deref()
            .ok_or(ExecutorErrorKind::MissingState("script"))?;

        let cancel = state.token.child_token();
        let uploaded = tokio::time::timeout(self.timeout, instance.upload_script(&cancel, script)).await;
        cancel.cancel();

        match uploaded {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(BackendError::from(BackendErrorKind::Timeout(self.timeout)).into()),
        }
    }
}

#[async_trait]
impl Step for UploadScript {
    fn name(&self) -> &'static str {
        "upload_script"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let folded = self
            .progress
            .then(|| state.log_writer.clone())
            .flatten()
            .filter(|_| state.job.start_attributes().progress_type == "text");

        if let Some(writer) = &folded
            && let Err(err) =
                write_fold_start(writer.as_ref(), FOLD, "\x1b[33;1mUploading script\x1b[0m\r\n").await
        {
            warn!(error = %err, "couldn't write fold start");
        }
        let uploaded = self.upload(state).await;
        if let Some(writer) = &folded
            && let Err(err) = write_fold_end(writer.as_ref(), FOLD).await
        {
            error!(error = %err, "couldn't write fold end");
        }

        match uploaded {
            Ok(()) => {
                let since = chrono::Utc::now() - state.processed_at;
                info!(since_processed_ms = since.num_milliseconds(), "uploaded script");
                StepAction::Continue
            }
            Err(err) => {
                error!(error = %err, upload_timeout = ?self.timeout, "couldn't upload script, attempting requeue");
                state.set_error(err);
                requeue_job(state).await;
                StepAction::Halt
            }
        }
    }
}
