//! Worker error types.

use std::path::PathBuf;

use servicebus_core::error::{ConfigurationError, DomainError};
use thiserror::Error;

/// Problems with the configuration file or environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid YAML or has unknown fields.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An environment variable holds a value of the wrong type.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was refused.
        reason: String,
    },

    /// A setting is out of range.
    #[error("invalid setting {key}: {reason}")]
    OutOfRange {
        /// Setting name.
        key: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },
}

/// Startup and runtime errors for the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Configuration file or environment problem.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Handler, saga or serializer wiring problem.
    #[error("kernel wiring error: {0}")]
    Wiring(#[from] ConfigurationError),

    /// The tracing subscriber could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Transport or storage failure while running.
    #[error("runtime error: {0}")]
    Runtime(#[from] DomainError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wiring_error_keeps_cause_message() {
        let err = WorkerError::from(ConfigurationError::MissingCommandHandler(
            "shop.place_order".to_owned(),
        ));

        assert_eq!(
            err.to_string(),
            "kernel wiring error: no handler registered for command shop.place_order"
        );
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = ConfigError::InvalidValue {
            key: "SERVICEBUS_CONCURRENCY".to_owned(),
            value: "many".to_owned(),
            reason: "invalid digit found in string".to_owned(),
        };

        assert_eq!(
            err.to_string(),
            "invalid value \"many\" for SERVICEBUS_CONCURRENCY: invalid digit found in string"
        );
    }
}
