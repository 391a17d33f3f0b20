use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use buildworker_core::{
    BackendError, BackendErrorKind, FinishState, Instance, Progresser, Provider, VERSION,
};
use tracing::{error, info, warn};

use crate::fold::{write_fold_end, write_fold_start};
use crate::pipeline::{Step, StepAction};
use crate::progress::{NullProgresser, TextProgresser};
use crate::state::JobState;
use crate::steps::{requeue_job, write_log_and_finish};

const FOLD: &str = "step_start_instance";

/// Boots the compute instance for the job.
///
/// Abort errors carry a message for the user and fail the job; every other
/// start failure hands the job back to the queue.
pub struct StartInstance {
    provider: Arc<dyn Provider>,
    startup_timeout: Duration,
}

impl StartInstance {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, startup_timeout: Duration) -> Self {
        Self {
            provider,
            startup_timeout,
        }
    }

    async fn start(&self, state: &JobState) -> Result<Arc<dyn Instance>, BackendError> {
        let cancel = state.token.child_token();
        let attrs = state.job.start_attributes();
        let progress_type = attrs.progress_type.as_str();

        let started = if self.provider.supports_progress() && !progress_type.is_empty() {
            let writer = state.log_writer.clone().filter(|_| progress_type == "text");
            let progresser: Box<dyn Progresser> = match &writer {
                Some(writer) => {
                    if let Err(err) = write_fold_start(
                        writer.as_ref(),
                        FOLD,
                        "\x1b[33;1mStarting instance\x1b[0m\r\n",
                    )
                    .await
                    {
                        warn!(error = %err, "couldn't write fold start");
                    }
                    Box::new(TextProgresser::new(Arc::clone(writer)))
                }
                None => {
                    warn!(progress_type, "unknown progress type");
                    Box::new(NullProgresser)
                }
            };

            let started = tokio::time::timeout(
                self.startup_timeout,
                self.provider
                    .start_with_progress(&cancel, attrs, progresser.as_ref()),
            )
            .await;

            if let Some(writer) = &writer
                && let Err(err) = write_fold_end(writer.as_ref(), FOLD).await
            {
                error!(error = %err, "couldn't write fold end");
            }
            started
        } else {
            tokio::time::timeout(self.startup_timeout, self.provider.start(&cancel, attrs)).await
        };

        match started {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(BackendErrorKind::Timeout(self.startup_timeout).into())
            }
        }
    }
}

impl std::fmt::Debug for StartInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartInstance")
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for StartInstance {
    fn name(&self) -> &'static str {
        "start_instance"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        info!("starting instance");
        let begun = Instant::now();

        match self.start(state).await {
            Ok(instance) => {
                info!(
                    boot_duration_ms = u64::try_from(begun.elapsed().as_millis()).unwrap_or(u64::MAX),
                    instance_id = %instance.id(),
                    image_name = %instance.image_name(),
                    version = VERSION,
                    warmed = instance.warmed(),
                    "started instance"
                );
                state.instance = Some(instance);
                StepAction::Continue
            }
            Err(err) => {
                if let Some(message) = err.job_abort_message().map(str::to_string) {
                    match state.log_writer.clone() {
                        Some(writer) => {
                            write_log_and_finish(state, writer.as_ref(), FinishState::Errored, &message)
                                .await;
                        }
                        None => super::finish_job(state, FinishState::Errored).await,
                    }
                } else {
                    error!(error = %err, startup_timeout = ?self.startup_timeout, "couldn't start instance, attempting requeue");
                    requeue_job(state).await;
                }
                state.set_error(err);
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&self, state: &mut JobState) {
        let Some(instance) = &state.instance else {
            info!("no instance to stop");
            return;
        };

        if state.skip_shutdown {
            error!(instance_id = %instance.id(), "skipping shutdown, VM will be left running");
            return;
        }

        match instance.stop().await {
            Ok(()) => info!(instance_id = %instance.id(), "stopped instance"),
            Err(err) => warn!(error = %err, instance_id = %instance.id(), "couldn't stop instance"),
        }
    }
}
