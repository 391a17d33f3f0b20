//! Fold markers that collapse sections of the job log.

use buildworker_core::{LogWriter, LogWriterError};

#[must_use]
pub fn fold_start(name: &str) -> String {
    format!("travis_fold:start:{name}\r\x1b[0K")
}

#[must_use]
pub fn fold_end(name: &str) -> String {
    format!("travis_fold:end:{name}\r\x1b[0K")
}

/// Writes the opening marker of fold `name` followed by `header`.
///
/// # Errors
///
/// Propagates the writer's error.
pub async fn write_fold_start(
    writer: &dyn LogWriter,
    name: &str,
    header: &str,
) -> Result<(), LogWriterError> {
    let out = fold_start(name) + header;
    writer.write(out.as_bytes()).await.map(drop)
}

/// Writes the closing marker of fold `name`.
///
/// # Errors
///
/// Propagates the writer's error.
pub async fn write_fold_end(writer: &dyn LogWriter, name: &str) -> Result<(), LogWriterError> {
    writer.write(fold_end(name).as_bytes()).await.map(drop)
}

/// Writes `body` wrapped in fold `name`. A missing trailing newline is
/// added so the end marker starts its own line.
///
/// # Errors
///
/// Propagates the writer's error.
pub async fn write_fold(writer: &dyn LogWriter, name: &str, body: &str) -> Result<(), LogWriterError> {
    let mut out = fold_start(name);
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&fold_end(name));
    writer.write(out.as_bytes()).await.map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildworker_core::testing::RecordingLogWriter;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_write_fold_adds_newline() {
        let writer = RecordingLogWriter::new();
        write_fold(&writer, "worker_info", "hello").await.unwrap();
        assert_eq!(
            writer.contents(),
            "travis_fold:start:worker_info\r\x1b[0Khello\ntravis_fold:end:worker_info\r\x1b[0K"
        );
    }

    #[tokio::test]
    async fn test_fold_start_and_end() {
        let writer = RecordingLogWriter::new();
        write_fold_start(&writer, "step", "Starting\r\n").await.unwrap();
        write_fold_end(&writer, "step").await.unwrap();
        assert_eq!(
            writer.contents(),
            "travis_fold:start:step\r\x1b[0KStarting\r\ntravis_fold:end:step\r\x1b[0K"
        );
    }

    #[tokio::test]
    async fn test_write_fold_keeps_existing_newline() {
        let writer = RecordingLogWriter::new();
        write_fold(&writer, "x", "line\n").await.unwrap();
        assert_eq!(writer.contents().matches('\n').count(), 1);
    }
}
