use async_trait::async_trait;
use buildworker_core::CancellationBroadcaster;

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Registers the job with the cancellation broadcaster.
#[derive(Debug, Clone)]
pub struct SubscribeCancellation {
    broadcaster: CancellationBroadcaster,
}

impl SubscribeCancellation {
    #[must_use]
    pub fn new(broadcaster: CancellationBroadcaster) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Step for SubscribeCancellation {
    fn name(&self) -> &'static str {
        "subscribe_cancellation"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        state.cancellation = Some(self.broadcaster.subscribe(state.job_id()));
        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut JobState) {
        if let Some(subscription) = state.cancellation.take() {
            self.broadcaster.unsubscribe(&subscription);
        }
    }
}
