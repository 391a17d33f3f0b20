use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::pipeline::{Step, StepAction};
use crate::state::JobState;

/// Rewrites the raw payload through an external filter.
///
/// The filter reads the payload JSON on stdin and prints the replacement on
/// stdout. Any failure leaves the payload untouched.
#[derive(Debug, Clone, Default)]
pub struct TransformPayload {
    executable: Option<String>,
}

impl TransformPayload {
    #[must_use]
    pub fn new(executable: Option<String>) -> Self {
        Self {
            executable: executable.filter(|e| !e.is_empty()),
        }
    }

    async fn filter(executable: &str, raw: &serde_json::Value) -> Result<serde_json::Value, String> {
        let input = serde_json::to_vec(raw).map_err(|e| format!("failed to marshal json: {e}"))?;

        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run filter executable: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| format!("failed to write payload: {e}"))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("failed to run filter executable: {e}"))?;
        if !output.status.success() {
            return Err(format!("filter executable exited with {}", output.status));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| format!("failed to unmarshal json: {e}"))
    }
}

#[async_trait]
impl Step for TransformPayload {
    fn name(&self) -> &'static str {
        "transform_payload"
    }

    async fn run(&self, state: &mut JobState) -> StepAction {
        let Some(executable) = &self.executable else {
            debug!("skipping json transformation, no filter executable defined");
            return StepAction::Continue;
        };

        info!(executable = %executable, "calling filter executable");
        match Self::filter(executable, state.job.raw_payload()).await {
            Ok(replaced) => {
                state.job.set_raw_payload(replaced);
                info!("replaced the build json");
            }
            Err(reason) => warn!(%reason, "payload left unchanged"),
        }
        StepAction::Continue
    }
}
