//! Diagnostic logging
//!
//! Tracing output goes to stderr so stdout stays free for the status stream.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Failed to initialize logging: {0}")]
    InitializationError(String),
}

/// Build the filter from `RUST_LOG`, falling back to `default_directive`
pub fn build_filter(default_directive: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive).map_err(|e| LoggingError::InvalidFilter {
        directive: default_directive.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber
pub fn init_tracing(default_directive: &str) -> Result<(), LoggingError> {
    let filter = build_filter(default_directive)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| LoggingError::InitializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("info").is_ok());
        assert!(build_filter("ota_relay_lib=debug,warn").is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_tracing("warn");
        assert!(matches!(
            init_tracing("warn"),
            Err(LoggingError::InitializationError(_))
        ));
    }
}
