//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the level passed in.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs a human readable subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_logging(level: &str) -> Result<(), TryInitError> {
    fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish()
        .try_init()
}

/// Installs a subscriber emitting one JSON object per event.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_json_logging(level: &str) -> Result<(), TryInitError> {
    fmt()
        .json()
        .with_env_filter(filter(level))
        .with_current_span(true)
        .with_span_list(false)
        .finish()
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging("debug");
        assert!(init_json_logging("info").is_err());
    }
}
