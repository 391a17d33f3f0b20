//! Error types for the worker's collaborators.
//!
//! Each concern gets an opaque error wrapping a kind enum, so callers can
//! match on [`JobErrorKind`] and friends without the wrapper leaking details.

use std::path::PathBuf;
use std::time::Duration;

/// Error returned by job lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct JobError(#[from] JobErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum JobErrorKind {
    #[error("job state transport failed: {reason}")]
    Transport { reason: String },

    #[error("invalid job payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("job log writer unavailable: {reason}")]
    LogWriter { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Creates a transport failure.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        JobErrorKind::Transport {
            reason: reason.into(),
        }
        .into()
    }

    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &JobErrorKind {
        &self.0
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobErrorKind::Io(err).into()
    }
}

/// Error returned by a compute provider or instance.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct BackendError(#[from] BackendErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum BackendErrorKind {
    #[error("instance start failed: {reason}")]
    Start { reason: String },

    /// The job cannot run at all; `message` is shown to the user.
    #[error("{message}")]
    JobAbort { message: String },

    #[error("script upload failed: {reason}")]
    Upload { reason: String },

    #[error("instance stop failed: {reason}")]
    Stop { reason: String },

    #[error("build trace download failed: {reason}")]
    Trace { reason: String },

    #[error("build trace not found")]
    TraceNotFound,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &BackendErrorKind {
        &self.0
    }

    /// User-facing message when the backend refused the job outright.
    #[must_use]
    pub fn job_abort_message(&self) -> Option<&str> {
        match &self.0 {
            BackendErrorKind::JobAbort { message } => Some(message),
            _ => None,
        }
    }
}

/// Error returned by [`Instance::run_script`](crate::Instance::run_script).
///
/// `completed` tells whether the script actually ran to the end. A script
/// that never completed can be requeued; one that did must not.
#[derive(Debug, thiserror::Error)]
#[error("running script failed (completed: {completed}): {reason}")]
pub struct RunScriptError {
    /// Whether the script ran to the end before the failure.
    pub completed: bool,
    /// Human readable cause.
    pub reason: String,
}

impl RunScriptError {
    /// The script never finished.
    #[must_use]
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            completed: false,
            reason: reason.into(),
        }
    }

    /// The script finished but its outcome could not be collected.
    #[must_use]
    pub fn completed(reason: impl Into<String>) -> Self {
        Self {
            completed: true,
            reason: reason.into(),
        }
    }
}

/// Error returned by a [`BuildScriptGenerator`](crate::BuildScriptGenerator).
#[derive(Debug, Clone, thiserror::Error)]
#[error("build script generation failed: {reason}")]
pub struct GeneratorError {
    /// Retrying may succeed.
    pub recoverable: bool,
    /// Human readable cause.
    pub reason: String,
}

impl GeneratorError {
    #[must_use]
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            reason: reason.into(),
        }
    }
}

/// Error returned by a [`BuildTracePersister`](crate::BuildTracePersister).
#[derive(Debug, thiserror::Error)]
#[error("persisting build trace failed: {reason}")]
pub struct PersistError {
    pub reason: String,
}

/// Error returned by log writers.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct LogWriterError(#[from] LogWriterErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum LogWriterErrorKind {
    #[error("log already closed")]
    Closed,

    #[error("log sink buffer has reached max size {max}")]
    SinkFull { max: usize },

    #[error("log transport failed: {reason}")]
    Transport { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LogWriterError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &LogWriterErrorKind {
        &self.0
    }

    /// Creates a transport failure.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        LogWriterErrorKind::Transport {
            reason: reason.into(),
        }
        .into()
    }
}

impl From<std::io::Error> for LogWriterError {
    fn from(err: std::io::Error) -> Self {
        LogWriterErrorKind::Io(err).into()
    }
}

/// Error returned by job queues.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct QueueError(#[from] QueueErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum QueueErrorKind {
    #[error("queue unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("invalid payload in {path}: {reason}", path = path.display())]
    Payload { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &QueueErrorKind {
        &self.0
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueErrorKind::Io(err).into()
    }
}

/// Error returned while loading configuration.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ConfigError(#[from] ConfigErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum ConfigErrorKind {
    #[error("cannot read {path}: {source}", path = path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported config format: {path}", path = path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("cannot parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &ConfigErrorKind {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_full_message() {
        let err: LogWriterError = LogWriterErrorKind::SinkFull { max: 150 }.into();
        assert_eq!(err.to_string(), "log sink buffer has reached max size 150");
    }

    #[test]
    fn test_job_abort_message() {
        let err: BackendError = BackendErrorKind::JobAbort {
            message: "image not allowed".to_string(),
        }
        .into();
        assert_eq!(err.job_abort_message(), Some("image not allowed"));

        let err: BackendError = BackendErrorKind::TraceNotFound.into();
        assert_eq!(err.job_abort_message(), None);
    }

    #[test]
    fn test_run_script_error_constructors() {
        assert!(!RunScriptError::incomplete("boom").completed);
        assert!(RunScriptError::completed("boom").completed);
    }
}
