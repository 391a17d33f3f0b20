//! # Buildworker Worker
//!
//! Pulls build jobs from queues and runs them on a resizable pool of
//! processors.
//!
//! ## Architecture
//!
//! - `queue`: the [`JobQueue`] contract, pull-based [`JobStream`]s and the
//!   channel and multi-source queues
//! - `file_queue`: [`FileJobQueue`], jobs as JSON files moved between state
//!   directories
//! - `processor`: [`Processor`], one job at a time through the pipeline
//! - `pool`: [`ProcessorPool`], resizing and graceful shutdown
//! - `logging`: tracing subscriber setup
//!
//! ## Example
//!
//! ```rust,ignore
//! use buildworker_worker::{FileJobQueue, ProcessorPool};
//!
//! let queue = FileJobQueue::new("/var/lib/buildworker", "builds.linux", poll).await?;
//! let pool = ProcessorPool::new(config, deps);
//! pool.run(4, Arc::new(queue), None).await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod file_queue;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod queue;

pub use file_queue::{FileJob, FileJobQueue};
pub use logging::{init_json_logging, init_logging};
pub use pool::ProcessorPool;
pub use processor::{Processor, ProcessorInfo, ProcessorStatus, processor_id};
pub use queue::{ChannelJobQueue, JobQueue, JobSender, JobSource, JobStream, MultiSourceJobQueue};

/// Error returned by the processor pool.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct PoolError(#[from] PoolErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum PoolErrorKind {
    /// No processor could be created for some of the requested slots.
    #[error("failed to populate pool: {}", errors.join("; "))]
    Populate { errors: Vec<String> },
}

impl PoolError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &PoolErrorKind {
        &self.0
    }
}

/// Result type for pool operations.
pub type PoolResult<T = ()> = Result<T, PoolError>;
