//! # Buildworker Logs
//!
//! Job output transport for the build worker.
//!
//! ## Architecture
//!
//! - `part`: the [`LogPart`] unit every writer emits
//! - `transport`: the [`LogPartTransport`] seam and its HTTP implementation
//! - `sink`: the bounded [`LogSink`] shared by writers of one destination
//! - `sink_writer`: [`SinkLogWriter`], one part per write, pushed into a sink
//! - `buffered`: [`BufferedLogWriter`], buffered bytes published in chunks
//! - `file`: [`FileLogWriter`], plain file output
//!
//! A full sink rejects new parts; writers turn that into write errors so
//! the running job fails instead of the worker buffering without bound.

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod buffered;
pub mod file;
pub mod part;
pub mod sink;
pub mod sink_writer;
pub mod transport;

pub use buffered::{BufferedLogWriter, BufferedLogWriterFactory};
pub use file::FileLogWriter;
pub use part::{LOG_CHUNK_SIZE, LogPart};
pub use sink::{LogSink, LogSinkConfig};
pub use sink_writer::{SinkLogWriter, SinkLogWriterFactory};
pub use transport::{HttpLogPartTransport, LogPartTransport, TransportError, TransportErrorKind};

#[cfg(test)]
pub(crate) mod test_support;
