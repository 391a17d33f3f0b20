use std::sync::Arc;

use async_trait::async_trait;
use buildworker_core::{BackoffPolicy, BuildScriptGenerator, GeneratorError, retry};
use tracing::{error, info};

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Produces the build script, preferring the job's own generator.
///
/// Recoverable errors from the shared generator are retried with backoff.
/// Any remaining error fails the job.
pub struct GenerateScript {
    generator: Arc<dyn BuildScriptGenerator>,
    retry: BackoffPolicy,
}

impl GenerateScript {
    #[must_use]
    pub fn new(generator: Arc<dyn BuildScriptGenerator>, retry: BackoffPolicy) -> Self {
        Self { generator, retry }
    }

    async fn generate(&self, state: &JobState) -> Result<Vec<u8>, GeneratorError> {
        let job = state.job.as_ref();
        if let Some(own) = job.script_generator() {
            info!("using job to get script");
            return own.generate(job).await;
        }

        info!("using build script generator to generate script");
        let generator = &self.generator;
        retry(
            &self.retry,
            &state.token,
            |err: &GeneratorError| err.recoverable,
            move || generator.generate(job),
        )
        .await
    }
}

impl std::fmt::Debug for GenerateScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateScript")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for GenerateScript {
    fn name(&self) -> &'static str {
        "generate_script"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        match self.generate(state).await {
            Ok(script) => {
                info!(bytes = script.len(), "generated script");
                state.script = Some(script);
                StepAction::Continue
            }
            Err(err) => {
                error!(error = %err, "couldn't generate build script, erroring job");
                if let Err(err) = state
                    .job
                    .error("An error occurred while generating the build script.")
                    .await
                {
                    error!(error = %err, "couldn't mark job errored");
                }
                state.set_error(err);
                StepAction::Halt
            }
        }
    }
}
