//! Log part transports.
//!
//! A transport publishes a batch of parts in one call. Retrying is left to
//! the caller so the sink can requeue a failed batch as a whole.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use sha1::{Digest, Sha1};
use url::Url;

use crate::part::LogPart;

/// Error publishing log parts.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct TransportError(#[from] TransportErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("invalid log endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("log part request failed: {reason}")]
    Request { reason: String },

    #[error("expected 204 but got {status}")]
    UnexpectedStatus { status: u16 },
}

impl TransportError {
    /// Returns the underlying kind.
    #[must_use]
    pub fn kind(&self) -> &TransportErrorKind {
        &self.0
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportErrorKind::Request {
            reason: err.to_string(),
        }
        .into()
    }
}

/// Destination for log parts.
#[async_trait]
pub trait LogPartTransport: Send + Sync {
    async fn publish(&self, parts: &[LogPart]) -> Result<(), TransportError>;
}

#[derive(Debug, Serialize)]
struct EncodedPart<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    job_id: u64,
    number: u64,
    content: String,
    encoding: &'static str,
    #[serde(rename = "final")]
    is_final: bool,
    tok: &'a str,
}

impl<'a> From<&'a LogPart> for EncodedPart<'a> {
    fn from(part: &'a LogPart) -> Self {
        Self {
            kind: "log_part",
            job_id: part.job_id,
            number: part.number,
            content: STANDARD.encode(&part.content),
            encoding: "base64",
            is_final: part.is_final,
            tok: &part.token,
        }
    }
}

/// Publishes parts as a JSON array to an HTTP log service.
#[derive(Debug, Clone)]
pub struct HttpLogPartTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpLogPartTransport {
    /// Creates a transport posting to `base_url` with `source=worker`.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse or the client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let mut url = Url::parse(base_url).map_err(|err| TransportErrorKind::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        url.query_pairs_mut().append_pair("source", "worker");

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// SHA-1 hex digest of the concatenated part tokens.
    #[must_use]
    pub fn signature(parts: &[LogPart]) -> String {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.token.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl LogPartTransport for HttpLogPartTransport {
    async fn publish(&self, parts: &[LogPart]) -> Result<(), TransportError> {
        let body: Vec<EncodedPart<'_>> = parts.iter().map(EncodedPart::from).collect();

        tracing::debug!(parts = parts.len(), url = %self.url, "publishing log parts");
        let response = self
            .client
            .post(self.url.clone())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token sig:{}", Self::signature(parts)),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            tracing::debug!(status = status.as_u16(), "log part publish rejected");
            return Err(TransportErrorKind::UnexpectedStatus {
                status: status.as_u16(),
            }
            .into());
        }
        Ok(())
    }
}
