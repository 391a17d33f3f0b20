//! Worker configuration.
//!
//! Durations are plain seconds in YAML/JSON files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::error::{ConfigError, ConfigErrorKind};

/// Settings shared by the pool, its processors and the pipeline steps.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent processors.
    pub pool_size: usize,
    /// Upper bound for a script run.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hard_timeout: Duration,
    /// Maximum time without log output.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub log_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub startup_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub script_upload_timeout: Duration,
    /// Pause between announcing a job and opening its log.
    #[serde_as(as = "DurationSeconds<f64>")]
    pub initial_sleep: Duration,
    /// Maximum job log size in bytes.
    pub max_log_length: usize,
    /// Leave the instance running when a job stalls, for debugging.
    pub skip_shutdown_on_log_timeout: bool,
    pub build_trace_enabled: bool,
    /// Executable rewriting the job payload (JSON on stdin and stdout).
    pub payload_filter_executable: Option<String>,
    /// Startup progress mode, `"text"` or empty.
    pub progress_type: String,
    pub infra: String,
    pub hostname: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub queue_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            hard_timeout: Duration::from_secs(50 * 60),
            log_timeout: Duration::from_secs(10 * 60),
            startup_timeout: Duration::from_secs(4 * 60),
            script_upload_timeout: Duration::from_secs(210),
            initial_sleep: Duration::from_secs(1),
            max_log_length: 4_500_000,
            skip_shutdown_on_log_timeout: false,
            build_trace_enabled: false,
            payload_filter_executable: None,
            progress_type: String::new(),
            infra: String::new(),
            hostname: default_hostname(),
            queue_poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Parses YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|err| ConfigErrorKind::Parse {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| ConfigErrorKind::Parse {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.yaml`, `.yml` or `.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, has another extension
    /// or does not parse.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigErrorKind::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => Err(ConfigErrorKind::UnsupportedFormat {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }

    /// Checks that sizes and timeouts are usable.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| -> ConfigError {
            ConfigErrorKind::Invalid {
                reason: reason.to_string(),
            }
            .into()
        };

        if self.pool_size == 0 {
            return Err(invalid("pool_size must be greater than zero"));
        }
        for (name, value) in [
            ("hard_timeout", self.hard_timeout),
            ("log_timeout", self.log_timeout),
            ("startup_timeout", self.startup_timeout),
            ("script_upload_timeout", self.script_upload_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(&format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Effective hard timeout for a job with an optional override.
    #[must_use]
    pub fn hard_timeout_for(&self, job_limit: Option<Duration>) -> Duration {
        job_limit.map_or(self.hard_timeout, |limit| limit.min(self.hard_timeout))
    }

    /// Effective silence timeout for a job with an optional override.
    #[must_use]
    pub fn log_timeout_for(&self, job_silence: Option<Duration>) -> Duration {
        job_silence.unwrap_or(self.log_timeout)
    }

    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_initial_sleep(mut self, sleep: Duration) -> Self {
        self.initial_sleep = sleep;
        self
    }
}

/// Host name from the environment, or `localhost`.
#[must_use]
pub fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_log_length, 4_500_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let config = WorkerConfig::from_yaml_str(
            "pool_size: 4\nhard_timeout: 600\ninitial_sleep: 0.5\ninfra: docker\n",
        )
        .unwrap();

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.hard_timeout, Duration::from_secs(600));
        assert_eq!(config.initial_sleep, Duration::from_millis(500));
        assert_eq!(config.infra, "docker");
        assert_eq!(config.log_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_config_rejects_zero_pool() {
        let err = WorkerConfig::from_json_str(r#"{"pool_size": 0}"#).unwrap_err();
        assert!(matches!(err.kind(), ConfigErrorKind::Invalid { .. }));
    }

    #[test]
    fn test_config_from_path() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"pool_size": 3, "skip_shutdown_on_log_timeout": true}}"#).unwrap();

        let config = WorkerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.pool_size, 3);
        assert!(config.skip_shutdown_on_log_timeout);
    }

    #[test]
    fn test_config_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let err = WorkerConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err.kind(), ConfigErrorKind::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_effective_timeouts() {
        let config = WorkerConfig::default().with_hard_timeout(Duration::from_secs(100));
        assert_eq!(config.hard_timeout_for(None), Duration::from_secs(100));
        assert_eq!(config.hard_timeout_for(Some(Duration::from_secs(10))), Duration::from_secs(10));
        assert_eq!(config.hard_timeout_for(Some(Duration::from_secs(500))), Duration::from_secs(100));
        assert_eq!(config.log_timeout_for(Some(Duration::from_secs(5))), Duration::from_secs(5));
    }
}
