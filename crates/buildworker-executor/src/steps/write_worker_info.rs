use async_trait::async_trait;
use buildworker_core::VERSION;
use tracing::warn;

use crate::fold::write_fold;
use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Writes a `worker_info` fold describing where the job runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteWorkerInfo;

#[async_trait]
impl Step for WriteWorkerInfo {
    fn name(&self) -> &'static str {
        "write_worker_info"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let (Some(writer), Some(instance)) = (&state.log_writer, &state.instance) else {
            return StepAction::Continue;
        };
        if state.hostname.is_empty() {
            return StepAction::Continue;
        }

        let body = [
            "\x1b[33;1mWorker information\x1b[0m".to_string(),
            format!("hostname: {}", state.hostname),
            format!("version: {VERSION}"),
            format!(
                "instance: {} {} (via {})",
                instance.id(),
                instance.image_name(),
                state.job.name()
            ),
            format!("startup: {:?}", instance.startup_duration()),
        ]
        .join("\n");

        if let Err(err) = write_fold(writer.as_ref(), "worker_info", &body).await {
            warn!(error = %err, "couldn't write worker info");
        }
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::running_state;
    use buildworker_core::testing::{FakeBackendConfig, FakeJob};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writes_worker_info_fold() {
        let (mut state, log, _) = running_state(
            FakeJob::new(1),
            FakeBackendConfig {
                startup_duration: Duration::from_millis(3),
                ..FakeBackendConfig::default()
            },
        )
        .await;

        assert_eq!(WriteWorkerInfo.run(&mut state).await, StepAction::Continue);
        let contents = log.contents();
        assert!(contents.starts_with("travis_fold:start:worker_info\r\x1b[0K"));
        assert!(contents.contains("hostname: worker-1.local\n"));
        assert!(contents.contains("instance: fake-0 fake-image (via fake)\n"));
        assert!(contents.contains("startup: 3ms\n"));
        assert!(contents.ends_with("travis_fold:end:worker_info\r\x1b[0K"));
    }

    #[tokio::test]
    async fn test_broken_log_is_ignored() {
        let (mut state, _, _) =
            running_state(FakeJob::new(1).with_broken_log_writer(), FakeBackendConfig::default()).await;

        assert_eq!(WriteWorkerInfo.run(&mut state).await, StepAction::Continue);
    }
}
