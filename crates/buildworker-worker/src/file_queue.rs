//! Queue backed by JSON files on local disk.
//!
//! Each queue lives under `{base}/{queue}` with one directory per job
//! state. A job is a `*.json` payload file that moves from `10-created.d`
//! through `30-received.d` and `50-started.d` to `70-finished.d`, where a
//! sibling `.state` file records how it ended. Logs go to `log/`.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{
    FinishState, Job, JobError, JobErrorKind, JobPayload, LogWriter, LogWriterError, QueueError,
    QueueErrorKind, StartAttributes,
};
use buildworker_logs::FileLogWriter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{JobQueue, JobSender, JobSource, JobStream, channel_source};

const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct QueueDirs {
    created: PathBuf,
    received: PathBuf,
    started: PathBuf,
    finished: PathBuf,
    log: PathBuf,
}

impl QueueDirs {
    fn new(root: &Path) -> Self {
        Self {
            created: root.join("10-created.d"),
            received: root.join("30-received.d"),
            started: root.join("50-started.d"),
            finished: root.join("70-finished.d"),
            log: root.join("log"),
        }
    }

    fn all(&self) -> [&Path; 5] {
        [
            self.created.as_path(),
            self.received.as_path(),
            self.started.as_path(),
            self.finished.as_path(),
            self.log.as_path(),
        ]
    }
}

/// File names currently handed out, so a slow job is not dispatched twice
/// while its payload still sits in `10-created.d`.
type Claims = Arc<Mutex<HashSet<OsString>>>;

/// Directory-backed [`JobQueue`].
///
/// One poller per queue scans `10-created.d`; every stream shares it.
pub struct FileJobQueue {
    queue: String,
    dirs: Arc<QueueDirs>,
    poll_interval: Duration,
    claims: Claims,
    shutdown: CancellationToken,
    source: Mutex<Option<Arc<dyn JobSource>>>,
}

impl std::fmt::Debug for FileJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJobQueue")
            .field("queue", &self.queue)
            .field("dirs", &self.dirs)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl FileJobQueue {
    /// Prepares the state directories of `queue` under `base_dir`.
    ///
    /// # Errors
    ///
    /// Fails when `base_dir` is missing, is not a writable directory, or
    /// the state directories cannot be created.
    pub async fn new(
        base_dir: impl AsRef<Path>,
        queue: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let base_dir = base_dir.as_ref();
        let queue = queue.into();

        let meta = tokio::fs::metadata(base_dir)
            .await
            .map_err(|err| QueueErrorKind::Unavailable {
                reason: format!("base dir {}: {err}", base_dir.display()),
            })?;
        if !meta.is_dir() {
            return Err(QueueErrorKind::Unavailable {
                reason: format!("base dir {} is not a directory", base_dir.display()),
            }
            .into());
        }

        let probe = base_dir.join(".write-test");
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|err| QueueErrorKind::Unavailable {
                reason: format!("base dir {} is not writable: {err}", base_dir.display()),
            })?;
        tokio::fs::remove_file(&probe).await?;

        let dirs = QueueDirs::new(&base_dir.join(&queue));
        for dir in dirs.all() {
            tokio::fs::create_dir_all(dir).await?;
        }

        Ok(Self {
            queue,
            dirs: Arc::new(dirs),
            poll_interval,
            claims: Claims::default(),
            shutdown: CancellationToken::new(),
            source: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn created_dir(&self) -> &Path {
        &self.dirs.created
    }

    #[must_use]
    pub fn finished_dir(&self) -> &Path {
        &self.dirs.finished
    }

    fn shared_source(&self) -> Arc<dyn JobSource> {
        let mut guard = self.source.lock();
        if let Some(source) = guard.as_ref() {
            return Arc::clone(source);
        }

        let (tx, source) = channel_source(1);
        let poller = Poller {
            dirs: Arc::clone(&self.dirs),
            claims: Arc::clone(&self.claims),
            shutdown: self.shutdown.clone(),
            tx,
        };
        tokio::spawn(poller.run(self.poll_interval));
        info!(queue = %self.queue, dir = %self.dirs.created.display(), "polling for jobs");

        *guard = Some(Arc::clone(&source));
        source
    }
}

#[async_trait]
impl JobQueue for FileJobQueue {
    async fn jobs(&self, token: CancellationToken) -> Result<JobStream, QueueError> {
        Ok(JobStream::new(self.shared_source(), token))
    }

    fn name(&self) -> String {
        "file".to_string()
    }

    async fn cleanup(&self) -> Result<(), QueueError> {
        self.shutdown.cancel();
        Ok(())
    }
}

struct Poller {
    dirs: Arc<QueueDirs>,
    claims: Claims,
    shutdown: CancellationToken,
    tx: JobSender,
}

impl Poller {
    async fn run(self, interval: Duration) {
        loop {
            if self.tx.is_closed() || !self.dispatch_created().await {
                break;
            }
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        debug!(dir = %self.dirs.created.display(), "file queue poller stopped");
    }

    /// Sends every unclaimed payload in `10-created.d`. Returns `false`
    /// once the queue shut down or nobody listens anymore.
    async fn dispatch_created(&self) -> bool {
        let paths = match self.created_payloads().await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(dir = %self.dirs.created.display(), error = %err, "couldn't list jobs");
                return true;
            }
        };

        for path in paths {
            let Some(file_name) = path.file_name().map(OsString::from) else {
                continue;
            };
            if self.claims.lock().contains(&file_name) {
                continue;
            }

            let job = match FileJob::load(&path, Arc::clone(&self.dirs), Arc::clone(&self.claims)).await {
                Ok(job) => job,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable job file");
                    continue;
                }
            };

            self.claims.lock().insert(file_name.clone());
            debug!(path = %path.display(), job_id = job.payload.job.id, "dispatching job");
            let sent = tokio::select! {
                () = self.shutdown.cancelled() => false,
                sent = self.tx.send(Box::new(job) as Box<dyn Job>) => sent.is_ok(),
            };
            if !sent {
                self.claims.lock().remove(&file_name);
                return false;
            }
        }
        true
    }

    async fn created_payloads(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dirs.created).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// A job read from a payload file.
pub struct FileJob {
    payload: JobPayload,
    raw: serde_json::Value,
    attrs: StartAttributes,
    dirs: Arc<QueueDirs>,
    claims: Claims,
    file_name: OsString,
    current: PathBuf,
    log_path: PathBuf,
    finish_state: Option<FinishState>,
    requeued: bool,
}

impl std::fmt::Debug for FileJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJob")
            .field("id", &self.payload.job.id)
            .field("current", &self.current)
            .field("finish_state", &self.finish_state)
            .field("requeued", &self.requeued)
            .finish_non_exhaustive()
    }
}

impl FileJob {
    async fn load(path: &Path, dirs: Arc<QueueDirs>, claims: Claims) -> Result<Self, QueueError> {
        let invalid = |reason: String| -> QueueError {
            QueueErrorKind::Payload {
                path: path.to_path_buf(),
                reason,
            }
            .into()
        };

        let bytes = tokio::fs::read(path).await?;
        let raw: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|err| invalid(err.to_string()))?;
        let payload = JobPayload::from_value(&raw).map_err(|err| invalid(err.to_string()))?;
        let attrs = StartAttributes::from_payload(&payload);

        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| invalid("no file name".to_string()))?;
        let log_path = dirs.log.join(Path::new(&file_name).with_extension("log"));

        Ok(Self {
            payload,
            raw,
            attrs,
            dirs,
            claims,
            file_name,
            current: path.to_path_buf(),
            log_path,
            finish_state: None,
            requeued: false,
        })
    }

    /// Where the payload file currently is.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.current
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn move_to(&mut self, dir: &Path) -> Result<(), JobError> {
        let target = dir.join(&self.file_name);
        if target != self.current {
            tokio::fs::rename(&self.current, &target).await?;
            self.current = target;
        }
        Ok(())
    }

    fn release(&self) {
        self.claims.lock().remove(&self.file_name);
    }

    fn log_timeout(&self, default: Duration) -> Duration {
        self.payload.timeouts.log_silence().unwrap_or(default)
    }
}

fn log_writer_error(err: &LogWriterError) -> JobError {
    JobErrorKind::LogWriter {
        reason: err.to_string(),
    }
    .into()
}

#[async_trait]
impl Job for FileJob {
    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn raw_payload(&self) -> &serde_json::Value {
        &self.raw
    }

    fn set_raw_payload(&mut self, raw: serde_json::Value) {
        self.raw = raw;
    }

    fn start_attributes(&self) -> &StartAttributes {
        &self.attrs
    }

    fn start_attributes_mut(&mut self) -> &mut StartAttributes {
        &mut self.attrs
    }

    fn finish_state(&self) -> Option<FinishState> {
        self.finish_state
    }

    fn requeued(&self) -> bool {
        self.requeued
    }

    async fn received(&mut self) -> Result<(), JobError> {
        let dir = self.dirs.received.clone();
        self.move_to(&dir).await
    }

    async fn started(&mut self) -> Result<(), JobError> {
        let dir = self.dirs.started.clone();
        self.move_to(&dir).await
    }

    async fn error(&mut self, message: &str) -> Result<(), JobError> {
        let writer = FileLogWriter::append(&self.log_path, self.log_timeout(DEFAULT_LOG_TIMEOUT))
            .await
            .map_err(|err| log_writer_error(&err))?;
        writer
            .write_and_close(message.as_bytes())
            .await
            .map_err(|err| log_writer_error(&err))?;
        self.finish(FinishState::Errored).await
    }

    async fn requeue(&mut self) -> Result<(), JobError> {
        let dir = self.dirs.created.clone();
        self.move_to(&dir).await?;
        self.requeued = true;
        self.release();
        Ok(())
    }

    async fn finish(&mut self, state: FinishState) -> Result<(), JobError> {
        let dir = self.dirs.finished.clone();
        self.move_to(&dir).await?;
        tokio::fs::write(self.current.with_extension("state"), state.as_str()).await?;
        self.finish_state = Some(state);
        self.release();
        Ok(())
    }

    async fn log_writer(&self, default_timeout: Duration) -> Result<Arc<dyn LogWriter>, JobError> {
        let writer = FileLogWriter::create(&self.log_path, self.log_timeout(default_timeout))
            .await
            .map_err(|err| log_writer_error(&err))?;
        Ok(Arc::new(writer))
    }

    fn name(&self) -> String {
        "file".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POLL: Duration = Duration::from_millis(10);

    async fn write_payload(queue: &FileJobQueue, name: &str, id: u64) {
        let payload = serde_json::json!({
            "job": {"id": id, "number": "1.1"},
            "repository": {"slug": "octo/files"},
            "config": {"language": "rust"},
            "timeouts": {"hard_limit": null, "log_silence": 30},
        });
        tokio::fs::write(queue.created_dir().join(name), payload.to_string())
            .await
            .unwrap();
    }

    async fn next(stream: &JobStream) -> Box<dyn Job> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_creates_state_dirs() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();

        for dir in ["10-created.d", "30-received.d", "50-started.d", "70-finished.d", "log"] {
            assert!(base.path().join("builds").join(dir).is_dir(), "{dir}");
        }
        assert_eq!(queue.name(), "file");
    }

    #[tokio::test]
    async fn test_new_rejects_missing_base_dir() {
        let base = tempfile::tempdir().unwrap();
        let err = FileJobQueue::new(base.path().join("nope"), "builds", POLL)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_job_moves_through_state_dirs() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();
        write_payload(&queue, "42.json", 42).await;

        let stream = queue.jobs(CancellationToken::new()).await.unwrap();
        let mut job = next(&stream).await;
        assert_eq!(job.payload().job.id, 42);
        assert_eq!(job.start_attributes().language, "rust");

        job.received().await.unwrap();
        assert!(base.path().join("builds/30-received.d/42.json").exists());
        job.started().await.unwrap();
        assert!(base.path().join("builds/50-started.d/42.json").exists());

        let log = job.log_writer(Duration::from_secs(60)).await.unwrap();
        log.write(b"hello\n").await.unwrap();
        log.close().await.unwrap();

        job.finish(FinishState::Passed).await.unwrap();
        assert!(queue.finished_dir().join("42.json").exists());
        let state = tokio::fs::read_to_string(queue.finished_dir().join("42.state"))
            .await
            .unwrap();
        assert_eq!(state, "passed");
        assert_eq!(job.finish_state(), Some(FinishState::Passed));

        let log = tokio::fs::read_to_string(base.path().join("builds/log/42.log"))
            .await
            .unwrap();
        assert_eq!(log, "hello\n");
        queue.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_requeued_job_is_delivered_again() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();
        write_payload(&queue, "7.json", 7).await;

        let stream = queue.jobs(CancellationToken::new()).await.unwrap();
        let mut job = next(&stream).await;
        job.received().await.unwrap();
        job.requeue().await.unwrap();
        assert!(job.requeued());
        assert!(queue.created_dir().join("7.json").exists());

        let again = next(&stream).await;
        assert_eq!(again.payload().job.id, 7);
        queue.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_claimed_job_is_not_dispatched_twice() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();
        write_payload(&queue, "1.json", 1).await;

        let stream = queue.jobs(CancellationToken::new()).await.unwrap();
        let _held = next(&stream).await;
        let second = tokio::time::timeout(POLL * 10, stream.next()).await;
        assert!(second.is_err());
        queue.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_appends_message_and_finishes_errored() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();
        tokio::fs::write(queue.created_dir().join("bad.txt"), "ignored").await.unwrap();
        write_payload(&queue, "9.json", 9).await;

        let stream = queue.jobs(CancellationToken::new()).await.unwrap();
        let mut job = next(&stream).await;
        job.error("script generation failed\n").await.unwrap();

        assert_eq!(job.finish_state(), Some(FinishState::Errored));
        let state = tokio::fs::read_to_string(queue.finished_dir().join("9.state"))
            .await
            .unwrap();
        assert_eq!(state, "errored");
        let log = tokio::fs::read_to_string(base.path().join("builds/log/9.log"))
            .await
            .unwrap();
        assert_eq!(log, "script generation failed\n");
        queue.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_payload_is_skipped() {
        let base = tempfile::tempdir().unwrap();
        let queue = FileJobQueue::new(base.path(), "builds", POLL).await.unwrap();
        tokio::fs::write(queue.created_dir().join("0.json"), "{not json")
            .await
            .unwrap();
        write_payload(&queue, "5.json", 5).await;

        let stream = queue.jobs(CancellationToken::new()).await.unwrap();
        assert_eq!(next(&stream).await.payload().job.id, 5);
        queue.cleanup().await.unwrap();
    }
}
