//! # Buildworker Core
//!
//! Domain types and collaborator contracts shared by every buildworker crate.
//!
//! ## Architecture
//!
//! - `job`: the [`Job`] trait, its payload and finish states
//! - `backend`: compute provider and instance contracts
//! - `generator`: build script generation and trace persistence contracts
//! - `log_writer`: the per-job [`LogWriter`] contract and its silence timer
//! - `cancel`: the [`CancellationBroadcaster`] keyed by job id
//! - `backoff`: exponential backoff and the retry helper
//! - `config`: [`WorkerConfig`] loading and validation
//! - `error`: error types for every collaborator
//!
//! Test doubles for all of the above live in `testing` behind the
//! `testing` feature.

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod generator;
pub mod job;
pub mod log_writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Instance, ProgressEntry, ProgressState, Progresser, Provider, RunResult};
pub use backoff::{BackoffPolicy, retry};
pub use cancel::{CancellationBroadcaster, CancellationCommand, CancellationSubscription};
pub use config::{WorkerConfig, default_hostname};
pub use error::{
    BackendError, BackendErrorKind, ConfigError, ConfigErrorKind, GeneratorError, JobError,
    JobErrorKind, LogWriterError, LogWriterErrorKind, PersistError, QueueError, QueueErrorKind,
    RunScriptError,
};
pub use generator::{BuildScriptGenerator, BuildTracePersister};
pub use job::{
    BuildInfo, FinishState, Job, JobInfo, JobMeta, JobPayload, JobStartedMeta, RepositoryInfo,
    StartAttributes, TimeoutsPayload,
};
pub use log_writer::{INITIAL_SILENCE_TIMEOUT, LengthLimit, LogWriter, LogWriterFactory, SilenceTimer};

/// Version reported in job logs and status output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
