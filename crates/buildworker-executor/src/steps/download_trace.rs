use std::sync::Arc;

use async_trait::async_trait;
use buildworker_core::{BackendErrorKind, BuildTracePersister};
use tracing::{error, info};

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Downloads the instance's build trace and hands it to the persister.
///
/// Best effort: nothing here changes how the job finished.
#[derive(Clone, Default)]
pub struct DownloadTrace {
    persister: Option<Arc<dyn BuildTracePersister>>,
}

impl DownloadTrace {
    /// Without a persister the step does nothing.
    #[must_use]
    pub fn new(persister: Option<Arc<dyn BuildTracePersister>>) -> Self {
        Self { persister }
    }
}

impl std::fmt::Debug for DownloadTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTrace")
            .field("enabled", &self.persister.is_some())
            .finish()
    }
}

#[async_trait]
impl Step for DownloadTrace {
    fn name(&self) -> &'static str {
        "download_trace"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let Some(persister) = &self.persister else {
            return StepAction::Continue;
        };
        if !state.job.payload().trace {
            return StepAction::Continue;
        }
        let Some(instance) = &state.instance else {
            return StepAction::Continue;
        };

        let trace = match instance.download_trace(&state.token).await {
            Ok(trace) => trace,
            Err(err) if matches!(err.kind(), BackendErrorKind::TraceNotFound) => {
                info!(error = %err, "skipping trace download");
                return StepAction::Continue;
            }
            Err(err) => {
                error!(error = %err, "couldn't download trace");
                return StepAction::Continue;
            }
        };
        info!(bytes = trace.len(), "downloaded trace");

        match persister.persist(state.job.as_ref(), &trace).await {
            Ok(()) => info!("persisted trace"),
            Err(err) => error!(error = %err, "couldn't persist trace"),
        }
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::running_state;
    use buildworker_core::testing::{FakeBackendConfig, FakeJob, MemoryTracePersister};
    use pretty_assertions::assert_eq;

    fn with_trace() -> FakeBackendConfig {
        FakeBackendConfig {
            trace: Some(b"trace-bytes".to_vec()),
            ..FakeBackendConfig::default()
        }
    }

    #[tokio::test]
    async fn test_persists_trace_when_requested() {
        let persister = Arc::new(MemoryTracePersister::default());
        let (mut state, _, _) = running_state(FakeJob::new(4).with_trace(true), with_trace()).await;

        let step = DownloadTrace::new(Some(persister.clone()));
        assert_eq!(step.run(&mut state).await, StepAction::Continue);
        assert_eq!(persister.traces(), vec![(4, b"trace-bytes".to_vec())]);
    }

    #[tokio::test]
    async fn test_skips_when_payload_has_no_trace() {
        let persister = Arc::new(MemoryTracePersister::default());
        let (mut state, _, _) = running_state(FakeJob::new(4), with_trace()).await;

        DownloadTrace::new(Some(persister.clone())).run(&mut state).await;
        assert!(persister.traces().is_empty());
    }

    #[tokio::test]
    async fn test_missing_trace_is_ignored() {
        let persister = Arc::new(MemoryTracePersister::default());
        let (mut state, _, _) =
            running_state(FakeJob::new(4).with_trace(true), FakeBackendConfig::default()).await;

        assert_eq!(
            DownloadTrace::new(Some(persister.clone())).run(&mut state).await,
            StepAction::Continue
        );
        assert!(persister.traces().is_empty());
        assert!(state.error.is_none());
    }
}
