//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::error::WorkerError;

/// Builds the filter: `RUST_LOG` when set, otherwise `default_directives`.
///
/// # Errors
///
/// Returns `WorkerError::Telemetry` if the chosen directives do not parse.
pub fn env_filter(
    rust_log: Option<&str>,
    default_directives: &str,
) -> Result<EnvFilter, WorkerError> {
    let directives = rust_log.unwrap_or(default_directives);
    EnvFilter::try_new(directives)
        .map_err(|e| WorkerError::Telemetry(format!("invalid log filter {directives:?}: {e}")))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns `WorkerError::Telemetry` for an invalid filter or when a global
/// subscriber is already installed.
pub fn init_tracing(default_directives: &str, format: LogFormat) -> Result<(), WorkerError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = env_filter(rust_log.as_deref(), default_directives)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|e| WorkerError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    #[test]
    fn test_rust_log_takes_precedence() {
        let filter = env_filter(Some("servicebus_worker=trace"), "info").unwrap();

        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_default_directives_apply_without_rust_log() {
        let filter = env_filter(None, "warn").unwrap();

        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn test_malformed_directives_are_reported() {
        let err = env_filter(None, "servicebus=[").unwrap_err();

        assert!(matches!(err, WorkerError::Telemetry(_)));
    }
}
