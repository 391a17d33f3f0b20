//! Test doubles for jobs, log writers and backends.
//!
//! Enabled with the `testing` feature so downstream crates can drive the
//! pipeline end to end without a real queue or compute backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{Instance, ProgressEntry, ProgressState, Progresser, Provider, RunResult};
use crate::error::{
    BackendError, BackendErrorKind, GeneratorError, JobError, LogWriterError, PersistError,
    RunScriptError,
};
use crate::generator::{BuildScriptGenerator, BuildTracePersister};
use crate::job::{FinishState, Job, JobPayload, JobStartedMeta, StartAttributes};
use crate::log_writer::{LengthLimit, LogWriter, SilenceTimer};

/// Shared, append-only record of lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct JobEvents(Arc<Mutex<Vec<String>>>);

impl JobEvents {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// In-memory job recording `received`, `started`, `requeued`, `errored`
/// and the finish state in call order.
pub struct FakeJob {
    payload: JobPayload,
    raw: serde_json::Value,
    attrs: StartAttributes,
    events: JobEvents,
    finish_state: Option<FinishState>,
    requeued: bool,
    log: Arc<RecordingLogWriter>,
    script: Option<Vec<u8>>,
}

impl FakeJob {
    #[must_use]
    pub fn new(id: u64) -> Self {
        let raw = serde_json::json!({
            "type": "job:test",
            "job": {"id": id, "number": format!("{id}.1")},
            "repository": {"id": 1, "slug": "fake/repo"},
            "config": {"language": "rust", "os": "linux"},
            "queue": "builds.fake",
        });
        let payload = JobPayload::from_value(&raw).unwrap_or_default();
        let attrs = StartAttributes::from_payload(&payload);

        Self {
            payload,
            raw,
            attrs,
            events: JobEvents::default(),
            finish_state: None,
            requeued: false,
            log: Arc::new(RecordingLogWriter::new()),
            script: None,
        }
    }

    #[must_use]
    pub fn with_hard_limit(mut self, secs: u64) -> Self {
        self.payload.timeouts.hard_limit = secs;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.payload.trace = trace;
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.payload.uuid = uuid.into();
        self
    }

    /// Uses a log writer that fails every write and close.
    #[must_use]
    pub fn with_broken_log_writer(mut self) -> Self {
        self.log = Arc::new(RecordingLogWriter::broken());
        self
    }

    #[must_use]
    pub fn with_log_writer(mut self, log: Arc<RecordingLogWriter>) -> Self {
        self.log = log;
        self
    }

    /// Makes the job generate its own build script.
    #[must_use]
    pub fn with_script(mut self, script: impl Into<Vec<u8>>) -> Self {
        self.script = Some(script.into());
        self
    }

    #[must_use]
    pub fn events(&self) -> JobEvents {
        self.events.clone()
    }

    #[must_use]
    pub fn log(&self) -> Arc<RecordingLogWriter> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl Job for FakeJob {
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
        self.events.push("received");
        Ok(())
    }

    async fn started(&mut self) -> Result<(), JobError> {
        self.events.push("started");
        Ok(())
    }

    async fn error(&mut self, _message: &str) -> Result<(), JobError> {
        self.finish_state = Some(FinishState::Errored);
        self.events.push("errored");
        Ok(())
    }

    async fn requeue(&mut self) -> Result<(), JobError> {
        self.requeued = true;
        self.events.push("requeued");
        Ok(())
    }

    async fn finish(&mut self, state: FinishState) -> Result<(), JobError> {
        self.finish_state = Some(state);
        self.events.push(state.as_str());
        Ok(())
    }

    async fn log_writer(&self, _default_timeout: Duration) -> Result<Arc<dyn LogWriter>, JobError> {
        Ok(Arc::clone(&self.log) as Arc<dyn LogWriter>)
    }

    fn name(&self) -> String {
        "fake".to_string()
    }

    fn script_generator(&self) -> Option<&dyn BuildScriptGenerator> {
        self.script.as_ref().map(|_| self as &dyn BuildScriptGenerator)
    }
}

#[async_trait]
impl BuildScriptGenerator for FakeJob {
    async fn generate(&self, _job: &dyn Job) -> Result<Vec<u8>, GeneratorError> {
        self.script
            .clone()
            .ok_or_else(|| GeneratorError::fatal("job has no script"))
    }
}

/// Log writer keeping everything in memory.
#[derive(Debug)]
pub struct RecordingLogWriter {
    content: Mutex<Vec<u8>>,
    closed: AtomicBool,
    finals: AtomicUsize,
    broken: bool,
    limit: LengthLimit,
    timer: SilenceTimer,
    started_meta: Mutex<Option<JobStartedMeta>>,
}

impl Default for RecordingLogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(3600))
    }

    /// Writer whose silence timer uses `timeout` once written to.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            content: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            finals: AtomicUsize::new(0),
            broken: false,
            limit: LengthLimit::default(),
            timer: SilenceTimer::new(timeout),
            started_meta: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new()
        }
    }

    /// Arms the silence timer as if output had just been written.
    pub fn arm(&self) {
        self.timer.reset();
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.content.lock()).into_owned()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of final parts emitted.
    #[must_use]
    pub fn finals(&self) -> usize {
        self.finals.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn started_meta(&self) -> Option<JobStartedMeta> {
        self.started_meta.lock().clone()
    }
}

#[async_trait]
impl LogWriter for RecordingLogWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        if self.broken {
            return Err(LogWriterError::transport("failed to write"));
        }
        if self.is_closed() {
            return Err(crate::error::LogWriterErrorKind::Closed.into());
        }

        self.timer.reset();
        if !self.limit.admit(buf.len()) {
            return Ok(0);
        }
        self.content.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&self) -> Result<(), LogWriterError> {
        if self.broken {
            return Err(LogWriterError::transport("failed to close"));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.timer.stop();
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn write_and_close(&self, buf: &[u8]) -> Result<usize, LogWriterError> {
        if self.broken {
            return Err(LogWriterError::transport("failed to write and close"));
        }
        if self.is_closed() {
            return Ok(0);
        }
        self.content.lock().extend_from_slice(buf);
        self.close().await?;
        Ok(buf.len())
    }

    async fn timed_out(&self) {
        self.timer.fired().await;
    }

    fn set_max_log_length(&self, bytes: usize) {
        self.limit.set_max(bytes);
    }

    fn set_job_started(&self, meta: JobStartedMeta) {
        *self.started_meta.lock() = Some(meta);
    }

    fn set_cancel_token(&self, token: CancellationToken) {
        self.limit.set_cancel_token(token);
    }

    fn max_length_reached(&self) -> bool {
        self.limit.reached()
    }
}

/// Knobs for [`FakeProvider`] instances.
#[derive(Debug, Clone, Default)]
pub struct FakeBackendConfig {
    pub startup_duration: Duration,
    pub run_sleep: Duration,
    pub log_output: String,
    pub exit_code: i32,
    /// Makes `start` fail with a user-facing abort message.
    pub abort_message: Option<String>,
    pub start_failure: Option<String>,
    pub upload_failure: Option<String>,
    pub trace: Option<Vec<u8>>,
    pub supports_progress: bool,
}

/// Provider booting [`FakeInstance`]s.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    config: FakeBackendConfig,
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
}

impl FakeProvider {
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn supports_progress(&self) -> bool {
        self.config.supports_progress
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        _attrs: &StartAttributes,
    ) -> Result<Arc<dyn Instance>, BackendError> {
        if let Some(message) = &self.config.abort_message {
            return Err(BackendErrorKind::JobAbort {
                message: message.clone(),
            }
            .into());
        }
        if let Some(reason) = &self.config.start_failure {
            return Err(BackendErrorKind::Start {
                reason: reason.clone(),
            }
            .into());
        }

        tokio::select! {
            () = tokio::time::sleep(self.config.startup_duration) => {}
            () = cancel.cancelled() => return Err(BackendErrorKind::Cancelled.into()),
        }

        let n = self.started.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeInstance {
            id: format!("fake-{n}"),
            config: self.config.clone(),
            stopped: Arc::clone(&self.stopped),
        }))
    }

    async fn start_with_progress(
        &self,
        cancel: &CancellationToken,
        attrs: &StartAttributes,
        progresser: &dyn Progresser,
    ) -> Result<Arc<dyn Instance>, BackendError> {
        progresser
            .progress(ProgressEntry::new("booting fake instance", ProgressState::Running))
            .await;
        let instance = self.start(cancel, attrs).await?;
        progresser
            .progress(ProgressEntry::new("fake instance ready", ProgressState::Success))
            .await;
        Ok(instance)
    }
}

/// Instance that prints the configured output, sleeps, then exits.
#[derive(Debug)]
pub struct FakeInstance {
    id: String,
    config: FakeBackendConfig,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl Instance for FakeInstance {
    async fn upload_script(
        &self,
        _cancel: &CancellationToken,
        _script: &[u8],
    ) -> Result<(), BackendError> {
        match &self.config.upload_failure {
            Some(reason) => Err(BackendErrorKind::Upload {
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn run_script(
        &self,
        cancel: CancellationToken,
        output: Arc<dyn LogWriter>,
    ) -> Result<RunResult, RunScriptError> {
        if !self.config.log_output.is_empty() {
            output
                .write(self.config.log_output.as_bytes())
                .await
                .map_err(|err| RunScriptError::incomplete(err.to_string()))?;
        }

        tokio::select! {
            () = tokio::time::sleep(self.config.run_sleep) => {}
            () = cancel.cancelled() => return Err(RunScriptError::incomplete("script run cancelled")),
        }

        Ok(RunResult {
            exit_code: self.config.exit_code,
            completed: true,
        })
    }

    async fn download_trace(&self, _cancel: &CancellationToken) -> Result<Vec<u8>, BackendError> {
        self.config
            .trace
            .clone()
            .ok_or_else(|| BackendErrorKind::TraceNotFound.into())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn image_name(&self) -> String {
        "fake-image".to_string()
    }

    fn startup_duration(&self) -> Duration {
        self.config.startup_duration
    }
}

/// Generator returning a fixed script, optionally failing first.
#[derive(Debug, Default)]
pub struct StaticScriptGenerator {
    script: Vec<u8>,
    failures: Mutex<Vec<GeneratorError>>,
    calls: AtomicUsize,
}

impl StaticScriptGenerator {
    #[must_use]
    pub fn new(script: impl Into<Vec<u8>>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Queues errors returned by the next calls, in order.
    #[must_use]
    pub fn with_failures(self, failures: Vec<GeneratorError>) -> Self {
        *self.failures.lock() = failures;
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildScriptGenerator for StaticScriptGenerator {
    async fn generate(&self, _job: &dyn Job) -> Result<Vec<u8>, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            Ok(self.script.clone())
        } else {
            Err(failures.remove(0))
        }
    }
}

/// Persister keeping traces in memory.
#[derive(Debug, Default)]
pub struct MemoryTracePersister {
    traces: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl MemoryTracePersister {
    #[must_use]
    pub fn traces(&self) -> Vec<(u64, Vec<u8>)> {
        self.traces.lock().clone()
    }
}

#[async_trait]
impl BuildTracePersister for MemoryTracePersister {
    async fn persist(&self, job: &dyn Job, trace: &[u8]) -> Result<(), PersistError> {
        self.traces
            .lock()
            .push((job.payload().job.id, trace.to_vec()));
        Ok(())
    }
}
