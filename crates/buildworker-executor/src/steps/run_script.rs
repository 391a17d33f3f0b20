use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{
    CancellationCommand, CancellationSubscription, FinishState, RunResult, RunScriptError,
};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::ExecutorErrorKind;
use crate::pipeline::{Step, StepAction};
use crate::state::JobState;
use crate::steps::check_cancellation::cancelled_message;
use crate::steps::{finish_job, requeue_job, write_log_and_finish};

const HARD_TIMEOUT_MESSAGE: &str =
    "\n\nThe job exceeded the maximum time limit for jobs, and has been terminated.\n\n";

const MAX_LOG_LENGTH_MESSAGE: &str =
    "\n\nThe job exceeded the maximum log length, and has been terminated.\n\n";

fn stalled_message(timeout: Duration) -> String {
    format!(
        "\n\nNo output has been received in the last {}, this potentially indicates a stalled build or something wrong with the build itself.\nCheck the details on how to adjust your build configuration on: https://docs.travis-ci.com/user/common-build-problems/#build-times-out-because-no-output-was-received\n\nThe build has been terminated\n\n",
        format_duration(timeout)
    )
}

/// Formats like `1h2m3s`, `10m0s`, `45s` or `500ms`.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

async fn next_cancellation(subscription: Option<&mut CancellationSubscription>) -> CancellationCommand {
    if let Some(subscription) = subscription
        && let Some(command) = subscription.recv().await
    {
        return command;
    }
    std::future::pending().await
}

enum Outcome {
    Cancelled(CancellationCommand),
    Deadline,
    Silence,
    Finished(Result<Result<RunResult, RunScriptError>, JoinError>),
    Interrupted,
}

/// Runs the script on the instance until it finishes or something stops it.
///
/// When several stop conditions are ready at once they are resolved in this
/// order: cancellation, hard timeout, log silence, script result,
/// interruption.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunScript {
    skip_shutdown_on_log_timeout: bool,
}

impl RunScript {
    #[must_use]
    pub fn new(skip_shutdown_on_log_timeout: bool) -> Self {
        Self {
            skip_shutdown_on_log_timeout,
        }
    }
}

#[async_trait]
impl Step for RunScript {
    fn name(&self) -> &'static str {
        "run_script"
    }

    #[allow(clippy::too_many_lines)]
    async fn run(&self, state: &mut JobState) -> StepAction {
        let (writer, instance) = match (state.require_log_writer(), state.require_instance()) {
            (Ok(writer), Ok(instance)) => (writer, instance),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "can't run script");
                state.set_error(err);
                return StepAction::Halt;
            }
        };

        let script_token = state.token.child_token();
        writer.set_cancel_token(script_token.clone());
        let deadline = Instant::now() + state.hard_timeout;

        info!(hard_timeout = ?state.hard_timeout, "running script");
        let mut handle = tokio::spawn({
            let (token, output) = (script_token.clone(), writer.clone());
            async move { instance.run_script(token, output).await }
        });

        let outcome = tokio::select! {
            biased;
            command = next_cancellation(state.cancellation.as_mut()) => Outcome::Cancelled(command),
            () = tokio::time::sleep_until(deadline) => Outcome::Deadline,
            () = writer.timed_out() => Outcome::Silence,
            joined = &mut handle => Outcome::Finished(joined),
            () = script_token.cancelled() => Outcome::Interrupted,
        };
        script_token.cancel();
        handle.abort();
        info!("finished script");

        match outcome {
            Outcome::Cancelled(command) => {
                info!(reason = %command.reason, "job cancelled while running");
                let message = cancelled_message(&command.reason);
                write_log_and_finish(state, writer.as_ref(), FinishState::Cancelled, &message).await;
                state.set_error(ExecutorErrorKind::JobCancelled {
                    reason: command.reason,
                });
                StepAction::Halt
            }
            Outcome::Deadline => {
                info!("hard timeout exceeded, terminating");
                write_log_and_finish(state, writer.as_ref(), FinishState::Errored, HARD_TIMEOUT_MESSAGE)
                    .await;
                state.set_error(ExecutorErrorKind::HardTimeoutExceeded(state.hard_timeout));
                StepAction::Continue
            }
            Outcome::Silence => {
                info!(log_timeout = ?state.log_timeout, "no log output, terminating");
                let message = stalled_message(state.log_timeout);
                write_log_and_finish(state, writer.as_ref(), FinishState::Errored, &message).await;
                state.set_error(ExecutorErrorKind::LogWriterTimeout(state.log_timeout));
                if self.skip_shutdown_on_log_timeout {
                    state.skip_shutdown = true;
                }
                StepAction::Continue
            }
            Outcome::Interrupted => {
                if writer.max_length_reached() {
                    write_log_and_finish(state, writer.as_ref(), FinishState::Errored, MAX_LOG_LENGTH_MESSAGE)
                        .await;
                    state.set_error(ExecutorErrorKind::MaxLogLengthExceeded);
                    return StepAction::Continue;
                }
                info!("job run was terminated, stopping job");
                state.set_error(ExecutorErrorKind::Terminated);
                StepAction::Halt
            }
            Outcome::Finished(joined) => {
                if Instant::now() >= deadline {
                    info!("hard timeout exceeded, terminating");
                    write_log_and_finish(state, writer.as_ref(), FinishState::Errored, HARD_TIMEOUT_MESSAGE)
                        .await;
                    state.set_error(ExecutorErrorKind::HardTimeoutExceeded(state.hard_timeout));
                    return StepAction::Continue;
                }
                if writer.max_length_reached() {
                    write_log_and_finish(state, writer.as_ref(), FinishState::Errored, MAX_LOG_LENGTH_MESSAGE)
                        .await;
                    state.set_error(ExecutorErrorKind::MaxLogLengthExceeded);
                    return StepAction::Continue;
                }

                let result = joined.unwrap_or_else(|err| {
                    Err(RunScriptError::incomplete(format!("script task failed: {err}")))
                });
                match result {
                    Ok(result) => {
                        info!(exit_code = result.exit_code, "script finished");
                        state.script_result = Some(result);
                        StepAction::Continue
                    }
                    Err(err) if err.completed => {
                        error!(error = %err, completed = true, "couldn't run script");
                        finish_job(state, FinishState::Errored).await;
                        state.set_error(err);
                        StepAction::Halt
                    }
                    Err(err) => {
                        error!(error = %err, completed = false, "couldn't run script, attempting requeue");
                        requeue_job(state).await;
                        state.set_error(err);
                        StepAction::Halt
                    }
                }
            }
        }
    }
}
