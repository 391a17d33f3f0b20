//! Log writer appending to a local file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{JobStartedMeta, LogWriter, LogWriterError, LogWriterErrorKind, SilenceTimer};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// File-backed writer. Has no maximum length.
#[derive(Debug)]
pub struct FileLogWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
    timer: SilenceTimer,
}

impl FileLogWriter {
    /// Creates or truncates `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub async fn create(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, LogWriterError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            timer: SilenceTimer::new(timeout),
        })
    }

    /// Opens `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn append(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, LogWriterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            timer: SilenceTimer::new(timeout),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogWriter for FileLogWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(LogWriterErrorKind::Closed)?;
        self.timer.reset();
        file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<(), LogWriterError> {
        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(());
        };
        self.timer.stop();
        file.flush().await?;
        Ok(())
    }

    async fn write_and_close(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(0);
        };
        self.timer.stop();
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(buf.len())
    }

    async fn timed_out(&self) {
        self.timer.fired().await;
    }

    fn set_max_log_length(&self, _bytes: usize) {}

    fn set_job_started(&self, _meta: JobStartedMeta) {}

    fn set_cancel_token(&self, _token: CancellationToken) {}

    fn max_length_reached(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_file_log_writer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let writer = FileLogWriter::create(&path, Duration::from_secs(60)).await.unwrap();

        writer.write(b"hello\n").await.unwrap();
        assert_eq!(writer.write_and_close(b"bye\n").await.unwrap(), 4);
        assert_eq!(writer.write_and_close(b"again").await.unwrap(), 0);
        writer.close().await.unwrap();
        assert!(writer.write(b"late").await.is_err());

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "hello\nbye\n");
    }

    #[tokio::test]
    async fn test_append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, "first\n").await.unwrap();

        let writer = FileLogWriter::append(&path, Duration::from_secs(60)).await.unwrap();
        writer.write_and_close(b"second\n").await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
