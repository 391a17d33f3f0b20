use async_trait::async_trait;
use buildworker_core::FinishState;
use tracing::info;

use crate::error::ExecutorErrorKind;
use crate::pipeline::{Step, StepAction};
use crate::state::JobState;
use crate::steps::{finish_job, write_log_and_finish};

/// Log message written when a job is cancelled.
#[must_use]
pub(crate) fn cancelled_message(reason: &str) -> String {
    format!("\n\nDone: Job Cancelled\n\n{reason}")
}

/// Halts the pipeline when a cancellation command is waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckCancellation;

#[async_trait]
impl Step for CheckCancellation {
    fn name(&self) -> &'static str {
        "check_cancellation"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let Some(command) = state.cancellation.as_mut().and_then(|c| c.try_recv()) else {
            return StepAction::Continue;
        };

        info!(reason = %command.reason, "job cancelled");
        match state.log_writer.clone() {
            Some(writer) => {
                write_log_and_finish(
                    state,
                    writer.as_ref(),
                    FinishState::Cancelled,
                    &cancelled_message(&command.reason),
                )
                .await;
            }
            None => finish_job(state, FinishState::Cancelled).await,
        }

        state.set_error(ExecutorErrorKind::JobCancelled {
            reason: command.reason,
        });
        StepAction::Halt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::state_for;
    use buildworker_core::testing::FakeJob;
    use buildworker_core::{CancellationBroadcaster, CancellationCommand};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_continues_without_command() {
        let broadcaster = CancellationBroadcaster::new();
        let mut state = state_for(FakeJob::new(1));
        state.cancellation = Some(broadcaster.subscribe(1));

        assert_eq!(CheckCancellation.run(&mut state).await, StepAction::Continue);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_cancels_through_open_log() {
        let broadcaster = CancellationBroadcaster::new();
        let job = FakeJob::new(1);
        let (events, log) = (job.events(), job.log());
        let mut state = state_for(job);
        state.cancellation = Some(broadcaster.subscribe(1));
        state.log_writer = Some(log.clone());

        broadcaster.broadcast(CancellationCommand::new(1, "user request"));

        assert_eq!(CheckCancellation.run(&mut state).await, StepAction::Halt);
        assert_eq!(log.contents(), "\n\nDone: Job Cancelled\n\nuser request");
        assert!(log.is_closed());
        assert_eq!(events.snapshot(), vec!["cancelled"]);
        assert!(state.error.as_ref().is_some_and(crate::ExecutorError::is_cancelled));
    }

    #[tokio::test]
    async fn test_cancels_without_log() {
        let broadcaster = CancellationBroadcaster::new();
        let job = FakeJob::new(2);
        let events = job.events();
        let mut state = state_for(job);
        state.cancellation = Some(broadcaster.subscribe(2));

        broadcaster.broadcast(CancellationCommand::new(2, "gone"));

        assert_eq!(CheckCancellation.run(&mut state).await, StepAction::Halt);
        assert_eq!(state.finish_state(), Some(FinishState::Cancelled));
        assert_eq!(events.snapshot(), vec!["cancelled"]);
    }
}
