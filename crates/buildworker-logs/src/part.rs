//! Log part, the unit of job output on the wire.

use buildworker_core::JobStartedMeta;

/// Maximum content size of one chunked part.
pub const LOG_CHUNK_SIZE: usize = 1653;

/// One numbered slice of a job's output.
///
/// Numbers start at zero and grow by one per part; the last part of a job
/// has `is_final` set and usually no content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogPart {
    pub job_id: u64,
    pub number: u64,
    pub content: Vec<u8>,
    pub is_final: bool,
    /// Per-job credential forwarded to the log service.
    pub token: String,
    /// Correlates parts with the processing attempt.
    pub uuid: String,
    pub meta: Option<JobStartedMeta>,
}

impl LogPart {
    #[must_use]
    pub fn content(job_id: u64, number: u64, content: impl Into<Vec<u8>>) -> Self {
        Self {
            job_id,
            number,
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn final_part(job_id: u64, number: u64) -> Self {
        Self {
            job_id,
            number,
            is_final: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }
}
