use std::time::Duration;

use async_trait::async_trait;

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Pauses before the job's log is opened.
#[derive(Debug, Clone, Copy)]
pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Step for Sleep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        // Termination is picked up by the runner before the next step.
        tokio::select! {
            () = tokio::time::sleep(self.duration) => {}
            () = state.token.cancelled() => {}
        }
        StepAction::Continue
    }
}
