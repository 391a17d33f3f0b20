//! Build job model.
//!
//! A [`Job`] is handed out by a queue and driven through the execution
//! pipeline by exactly one processor at a time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, DurationSeconds, serde_as};

use crate::error::JobError;
use crate::generator::BuildScriptGenerator;
use crate::log_writer::LogWriter;

/// Terminal state a job finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishState {
    Passed,
    Failed,
    Errored,
    Cancelled,
}

impl FinishState {
    /// Maps a script exit code to a finish state.
    #[must_use]
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Passed,
            1 => Self::Failed,
            _ => Self::Errored,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FinishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of the job payload delivered by the job source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub job: JobInfo,
    #[serde(rename = "source")]
    pub build: BuildInfo,
    pub repository: RepositoryInfo,
    pub uuid: String,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub timeouts: TimeoutsPayload,
    pub vm_type: String,
    pub vm_size: String,
    pub meta: JobMeta,
    pub queue: String,
    pub trace: bool,
    pub warmer: bool,
}

impl JobPayload {
    /// Parses a payload from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON does not describe a payload.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, JobError> {
        serde_json::from_value(raw.clone()).map_err(|err| {
            crate::error::JobErrorKind::InvalidPayload {
                reason: err.to_string(),
            }
            .into()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    pub id: u64,
    pub number: String,
    pub queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub id: u64,
    pub number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryInfo {
    pub id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMeta {
    pub state_update_count: u32,
}

/// Per-job timeout overrides in seconds. Zero or null means unset.
#[serde_as]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsPayload {
    #[serde_as(as = "DefaultOnNull")]
    pub hard_limit: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub log_silence: u64,
}

impl TimeoutsPayload {
    #[must_use]
    pub fn hard_limit(&self) -> Option<Duration> {
        (self.hard_limit > 0).then(|| Duration::from_secs(self.hard_limit))
    }

    #[must_use]
    pub fn log_silence(&self) -> Option<Duration> {
        (self.log_silence > 0).then(|| Duration::from_secs(self.log_silence))
    }
}

/// Attributes used to pick and boot a compute instance.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartAttributes {
    pub language: String,
    pub os: String,
    pub dist: String,
    pub group: String,
    pub arch: String,
    pub image_name: String,
    pub vm_type: String,
    pub vm_size: String,
    pub warmer: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hard_timeout: Duration,
    pub progress_type: String,
}

impl StartAttributes {
    /// Derives start attributes from the payload's build config.
    #[must_use]
    pub fn from_payload(payload: &JobPayload) -> Self {
        let field = |key: &str| {
            payload
                .config
                .get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            language: field("language"),
            os: field("os"),
            dist: field("dist"),
            group: field("group"),
            arch: field("arch"),
            image_name: field("image"),
            vm_type: payload.vm_type.clone(),
            vm_size: payload.vm_size.clone(),
            warmer: payload.warmer,
            ..Self::default()
        }
    }
}

/// Metadata attached to the first log part published after a job starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStartedMeta {
    pub queued_at: Option<DateTime<Utc>>,
    pub repo: String,
    pub queue: String,
    pub infra: String,
}

/// A build job handed out by a queue.
///
/// Lifecycle calls may be retried after partial failure, so implementations
/// must tolerate being asked for the same transition twice.
#[async_trait]
pub trait Job: Send + Sync {
    fn payload(&self) -> &JobPayload;

    /// Payload as delivered, including fields the typed view drops.
    fn raw_payload(&self) -> &serde_json::Value;

    /// Replaces the raw payload forwarded to script generation.
    fn set_raw_payload(&mut self, raw: serde_json::Value);

    fn start_attributes(&self) -> &StartAttributes;

    fn start_attributes_mut(&mut self) -> &mut StartAttributes;

    /// Terminal state, once [`Job::finish`] ran.
    fn finish_state(&self) -> Option<FinishState>;

    fn requeued(&self) -> bool;

    async fn received(&mut self) -> Result<(), JobError>;

    async fn started(&mut self) -> Result<(), JobError>;

    /// Reports a user-facing error and finishes the job as errored.
    async fn error(&mut self, message: &str) -> Result<(), JobError>;

    /// Hands the job back to its source for another attempt.
    async fn requeue(&mut self) -> Result<(), JobError>;

    async fn finish(&mut self, state: FinishState) -> Result<(), JobError>;

    /// Opens the job's own log writer.
    async fn log_writer(&self, default_timeout: Duration) -> Result<Arc<dyn LogWriter>, JobError>;

    fn name(&self) -> String;

    /// Jobs that carry their own build script return a generator here.
    fn script_generator(&self) -> Option<&dyn BuildScriptGenerator> {
        None
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.payload().job.id)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
