//! Errors recorded by pipeline steps.

use std::time::Duration;

use buildworker_core::{BackendError, GeneratorError, JobError, LogWriterError, RunScriptError};

/// Reason a job run stopped early or ended badly.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ExecutorError(#[from] ExecutorErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorErrorKind {
    #[error("job cancelled: {reason}")]
    JobCancelled { reason: String },

    #[error("hard timeout of {0:?} exceeded")]
    HardTimeoutExceeded(Duration),

    #[error("no log output for {0:?}")]
    LogWriterTimeout(Duration),

    #[error("maximum log length exceeded")]
    MaxLogLengthExceeded,

    #[error("job run terminated")]
    Terminated,

    #[error("missing pipeline state: {0}")]
    MissingState(&'static str),

    #[error(transparent)]
    ScriptGeneration(#[from] GeneratorError),

    #[error(transparent)]
    LogWriter(#[from] LogWriterError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    RunScript(#[from] RunScriptError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ExecutorError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &ExecutorErrorKind {
        &self.0
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.0, ExecutorErrorKind::JobCancelled { .. })
    }
}

macro_rules! from_source {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for ExecutorError {
                fn from(err: $source) -> Self {
                    Self(err.into())
                }
            }
        )*
    };
}

from_source!(GeneratorError, LogWriterError, BackendError, RunScriptError, JobError);

/// Executor result type
pub type ExecutorResult<T = ()> = Result<T, ExecutorError>;
