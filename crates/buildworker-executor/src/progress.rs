//! Startup progress reporters.

use std::sync::Arc;

use async_trait::async_trait;
use buildworker_core::{LogWriter, ProgressEntry, ProgressState, Progresser};

/// Writes each progress entry as a line of the job log.
pub struct TextProgresser {
    writer: Arc<dyn LogWriter>,
}

impl TextProgresser {
    #[must_use]
    pub fn new(writer: Arc<dyn LogWriter>) -> Self {
        Self { writer }
    }

    fn line(entry: &ProgressEntry) -> String {
        let marker = match entry.state {
            ProgressState::Running => "",
            ProgressState::Success => " ✓",
            ProgressState::Failure => " ✗",
        };
        let prefix = if entry.interrupts { "\r\n" } else { "" };
        let suffix = if entry.continues { "" } else { "\r\n" };
        format!("{prefix}{}{marker}{suffix}", entry.message)
    }
}

impl std::fmt::Debug for TextProgresser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextProgresser").finish_non_exhaustive()
    }
}

#[async_trait]
impl Progresser for TextProgresser {
    async fn progress(&self, entry: ProgressEntry) {
        if let Err(err) = self.writer.write(Self::line(&entry).as_bytes()).await {
            tracing::warn!(error = %err, "couldn't write progress");
        }
    }
}

/// Drops every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgresser;

#[async_trait]
impl Progresser for NullProgresser {
    async fn progress(&self, _entry: ProgressEntry) {}
}
