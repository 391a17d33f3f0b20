use async_trait::async_trait;
use tracing::error;

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Tells the job source the job was picked up. Failures are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendReceived;

#[async_trait]
impl Step for SendReceived {
    fn name(&self) -> &'static str {
        "send_received"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        if let Err(err) = state.job.received().await {
            error!(error = %err, "couldn't send received event");
        }
        StepAction::Continue
    }
}
