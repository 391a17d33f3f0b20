use async_trait::async_trait;
use buildworker_core::{FinishState, JobStartedMeta};
use tracing::{error, info};

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;
use crate::steps::finish_job;

/// Marks the job started, and finishes it from the script result on
/// cleanup.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateState;

#[async_trait]
impl Step for UpdateState {
    fn name(&self) -> &'static str {
        "update_state"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        if let Some(instance) = &state.instance {
            let id = instance.id();
            if !id.is_empty() {
                tracing::Span::current().record("instance_id", id.as_str());
            }
        }

        if let Some(writer) = &state.log_writer {
            let payload = state.job.payload();
            writer.set_job_started(JobStartedMeta {
                queued_at: payload.job.queued_at,
                repo: payload.repository.slug.clone(),
                queue: payload.queue.clone(),
                infra: state.infra.clone(),
            });
        }

        if let Err(err) = state.job.started().await {
            error!(error = %err, "couldn't mark job as started");
        }

        let since = chrono::Utc::now() - state.processed_at;
        info!(since_processed_ms = since.num_milliseconds(), action = "run", "marked job as started");
        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut JobState) {
        let since = chrono::Utc::now() - state.processed_at;
        info!(since_processed_ms = since.num_milliseconds(), action = "cleanup", "cleaning up");

        // Terminal states set by later steps stay as they are.
        if state.finish_state().is_some() {
            return;
        }
        if let Some(result) = state.script_result {
            finish_job(state, FinishState::from_exit_code(result.exit_code)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::running_state;
    use buildworker_core::RunResult;
    use buildworker_core::testing::{FakeBackendConfig, FakeJob};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[tokio::test]
    async fn test_marks_started_with_meta() {
        let job = FakeJob::new(1);
        let events = job.events();
        let (mut state, log, _) = running_state(job, FakeBackendConfig::default()).await;

        assert_eq!(UpdateState.run(&mut state).await, StepAction::Continue);
        assert_eq!(events.snapshot(), vec!["started"]);

        let meta = log.started_meta().unwrap();
        assert_eq!(meta.repo, "fake/repo");
        assert_eq!(meta.queue, "builds.fake");
        assert_eq!(meta.infra, "test");
    }

    #[rstest]
    #[case(0, "passed")]
    #[case(1, "failed")]
    #[case(137, "errored")]
    #[tokio::test]
    async fn test_cleanup_finishes_from_exit_code(#[case] exit_code: i32, #[case] expected: &str) {
        let job = FakeJob::new(1);
        let events = job.events();
        let (mut state, _, _) = running_state(job, FakeBackendConfig::default()).await;
        state.script_result = Some(RunResult {
            exit_code,
            completed: true,
        });

        UpdateState.cleanup(&mut state).await;
        assert_eq!(events.snapshot(), vec![expected]);
    }

    #[tokio::test]
    async fn test_cleanup_without_result_does_nothing() {
        let job = FakeJob::new(1);
        let events = job.events();
        let (mut state, _, _) = running_state(job, FakeBackendConfig::default()).await;

        UpdateState.cleanup(&mut state).await;
        assert!(events.snapshot().is_empty());
    }
}
