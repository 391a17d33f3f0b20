//! # Buildworker Executor
//!
//! Runs one job attempt through an ordered list of steps.
//!
//! ## Architecture
//!
//! - `state`: [`JobState`], the typed state shared by the steps of one run
//! - `pipeline`: the [`Step`] trait and the [`Pipeline`] runner
//! - `steps`: every step of the standard job pipeline
//! - `fold`: fold markers around sections of the job log
//! - `progress`: startup progress written into the job log
//!
//! ## Example
//!
//! ```rust,ignore
//! use buildworker_executor::{JobState, PipelineDeps, job_pipeline};
//!
//! let pipeline = job_pipeline(&deps, &config);
//! let mut state = JobState::new(job, token);
//! pipeline.run(&mut state).await;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fold;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod steps;

pub use error::{ExecutorError, ExecutorErrorKind, ExecutorResult};
pub use pipeline::{Pipeline, Step, StepAction};
pub use progress::{NullProgresser, TextProgresser};
pub use state::JobState;
pub use steps::{PipelineDeps, job_pipeline};
