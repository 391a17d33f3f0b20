//! Step trait and the sequential pipeline runner.

use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ExecutorErrorKind;
use crate::state::JobState;

/// What the runner does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Stop forward progress and start cleaning up.
    Halt,
}

/// One stage of a job run.
///
/// Steps hold configuration only. Everything produced during a run lives in
/// the [`JobState`].
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &mut JobState) -> StepAction;

    /// Compensates for [`Step::run`]. Called for every step that ran, in
    /// reverse order, whether the pipeline halted or not.
    async fn cleanup(&self, _state: &mut JobState) {}
}

/// Ordered list of steps.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs the steps in order, then cleans up the ones that ran.
    ///
    /// Returns the action of the last step that ran.
    pub async fn run(&self, state: &mut JobState) -> StepAction {
        let mut ran = 0;
        let mut action = StepAction::Continue;

        for step in &self.steps {
            if state.token.is_cancelled() {
                debug!(step = step.name(), "pipeline terminated before step");
                if state.error.is_none() {
                    state.set_error(ExecutorErrorKind::Terminated);
                }
                action = StepAction::Halt;
                break;
            }

            let started = Instant::now();
            action = step.run(state).await;
            ran += 1;
            debug!(
                step = step.name(),
                ?action,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "step finished"
            );

            if action == StepAction::Halt {
                break;
            }
        }

        for step in self.steps[..ran].iter().rev() {
            step.cleanup(state).await;
        }
        action
    }
}
