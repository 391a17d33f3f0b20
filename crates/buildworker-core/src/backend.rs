//! Compute backend contracts.
//!
//! A [`Provider`] boots an [`Instance`] for a job; the instance receives the
//! build script, runs it and is stopped afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, RunScriptError};
use crate::job::StartAttributes;
use crate::log_writer::LogWriter;

/// Outcome of a script run that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Running,
    Success,
    Failure,
}

/// One progress update emitted while an instance boots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub message: String,
    pub state: ProgressState,
    /// Interrupts the current line, e.g. a spinner tick.
    pub interrupts: bool,
    pub continues: bool,
}

impl ProgressEntry {
    #[must_use]
    pub fn new(message: impl Into<String>, state: ProgressState) -> Self {
        Self {
            message: message.into(),
            state,
            interrupts: false,
            continues: false,
        }
    }
}

/// Receives startup progress from providers that support it.
#[async_trait]
pub trait Progresser: Send + Sync {
    async fn progress(&self, entry: ProgressEntry);
}

/// Starts compute instances.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Whether [`Provider::start_with_progress`] reports anything useful.
    fn supports_progress(&self) -> bool {
        false
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Arc<dyn Instance>, BackendError>;

    async fn start_with_progress(
        &self,
        cancel: &CancellationToken,
        attrs: &StartAttributes,
        progresser: &dyn Progresser,
    ) -> Result<Arc<dyn Instance>, BackendError> {
        let _ = progresser;
        self.start(cancel, attrs).await
    }
}

/// A booted compute instance owned by a single job.
#[async_trait]
pub trait Instance: Send + Sync {
    async fn upload_script(
        &self,
        cancel: &CancellationToken,
        script: &[u8],
    ) -> Result<(), BackendError>;

    /// Runs the uploaded script, streaming its output into `output`.
    async fn run_script(
        &self,
        cancel: CancellationToken,
        output: Arc<dyn LogWriter>,
    ) -> Result<RunResult, RunScriptError>;

    async fn download_trace(&self, cancel: &CancellationToken) -> Result<Vec<u8>, BackendError>;

    async fn stop(&self) -> Result<(), BackendError>;

    fn id(&self) -> String;

    fn image_name(&self) -> String;

    fn startup_duration(&self) -> Duration;

    fn warmed(&self) -> bool {
        false
    }
}
