//! Worker configuration.
//!
//! Settings come from an optional YAML document and are then overridden by
//! `SERVICEBUS_*` environment variables. Unknown keys in the document are
//! refused.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use servicebus_core::error::{ConfigurationError, ErrorKind};
use servicebus_core::retry::RetryPolicy;

use crate::error::ConfigError;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SERVICEBUS_";

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {other}, expected json or pretty")),
        }
    }
}

/// Retry applied around handlers that do not declare their own policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    /// Total attempts per delivery, first one included.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    /// Name reported in logs.
    pub service_name: String,
    /// Maximum deliveries processed at the same time.
    pub concurrency: usize,
    /// Default `EnvFilter` directives.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Default handler retry.
    pub retry: RetrySettings,
    /// Default handler timeout; none when absent.
    pub handler_timeout_ms: Option<u64>,
    /// Versions between two aggregate snapshots.
    pub snapshot_interval: u64,
    /// Period of the scheduler's due-operation scan.
    pub scheduler_tick_ms: u64,
    /// Redeliveries allowed for a delivery that keeps hitting conflicts.
    pub max_redeliveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "servicebus-worker".to_owned(),
            concurrency: 10,
            log_filter: "info".to_owned(),
            log_format: LogFormat::Json,
            retry: RetrySettings::default(),
            handler_timeout_ms: None,
            snapshot_interval: 10,
            scheduler_tick_ms: 1_000,
            max_redeliveries: 5,
        }
    }
}

impl WorkerConfig {
    /// Parses a YAML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed documents or unknown keys,
    /// and `ConfigError::OutOfRange` for invalid settings.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        let config: Self = if document.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(document)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the document at `path` (defaults when `None`), then applies the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns any read, parse, override or range error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&document)?
            }
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `SERVICEBUS_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable values and
    /// `ConfigError::OutOfRange` when the result is invalid.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = var("SERVICE_NAME") {
            self.service_name = value;
        }
        if let Some((_, value)) = var("LOG_FILTER") {
            self.log_filter = value;
        }
        if let Some((key, value)) = var("LOG_FORMAT") {
            self.log_format = parse(key, value)?;
        }
        if let Some((key, value)) = var("CONCURRENCY") {
            self.concurrency = parse(key, value)?;
        }
        if let Some((key, value)) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse(key, value)?;
        }
        if let Some((key, value)) = var("RETRY_DELAY_MS") {
            self.retry.delay_ms = parse(key, value)?;
        }
        if let Some((key, value)) = var("HANDLER_TIMEOUT_MS") {
            self.handler_timeout_ms = Some(parse(key, value)?);
        }
        if let Some((key, value)) = var("SNAPSHOT_INTERVAL") {
            self.snapshot_interval = parse(key, value)?;
        }
        if let Some((key, value)) = var("SCHEDULER_TICK_MS") {
            self.scheduler_tick_ms = parse(key, value)?;
        }
        if let Some((key, value)) = var("MAX_REDELIVERIES") {
            self.max_redeliveries = parse(key, value)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` for the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.concurrency == 0, "concurrency", "must be at least 1"),
            (
                self.retry.max_attempts == 0,
                "retry.max_attempts",
                "must be at least 1",
            ),
            (
                self.snapshot_interval == 0,
                "snapshot_interval",
                "must be at least 1",
            ),
            (
                self.scheduler_tick_ms == 0,
                "scheduler_tick_ms",
                "must be at least 1",
            ),
            (
                self.handler_timeout_ms == Some(0),
                "handler_timeout_ms",
                "must be at least 1 when set",
            ),
        ];
        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, key, reason)) => Err(ConfigError::OutOfRange { key, reason }),
            None => Ok(()),
        }
    }

    /// Default handler retry policy. Conflicts, infrastructure failures and
    /// timeouts are retried.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidRetryPolicy` for zero attempts.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigurationError> {
        Ok(RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
        )?
        .retry_on(ErrorKind::Concurrency)
        .retry_on(ErrorKind::Infrastructure)
        .retry_on(ErrorKind::Timeout))
    }

    /// Default handler timeout.
    #[must_use]
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Scheduler scan period.
    #[must_use]
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

fn parse<T>(key: String, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_yaml_document_overrides_defaults() {
        // Arrange
        let document = r"
service_name: billing
concurrency: 4
log_format: pretty
retry:
  max_attempts: 5
handler_timeout_ms: 1500
";

        // Act
        let config = WorkerConfig::from_yaml(document).unwrap();

        // Assert
        assert_eq!(config.service_name, "billing");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_ms, 200);
        assert_eq!(config.handler_timeout(), Some(Duration::from_millis(1_500)));
        assert_eq!(config.snapshot_interval, 10);
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        assert_eq!(WorkerConfig::from_yaml("  \n").unwrap(), WorkerConfig::default());
    }

    #[test]
    fn test_unknown_key_is_refused() {
        let err = WorkerConfig::from_yaml("prefetch: 20\n").unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_environment_wins_over_document() {
        let config = WorkerConfig::from_yaml("concurrency: 4\nlog_filter: debug\n").unwrap();

        let config = config
            .with_env_overrides(env(&[
                ("SERVICEBUS_CONCURRENCY", "16"),
                ("SERVICEBUS_RETRY_DELAY_MS", "50"),
                ("SERVICEBUS_LOG_FORMAT", "Pretty"),
            ]))
            .unwrap();

        assert_eq!(config.concurrency, 16);
        assert_eq!(config.retry.delay_ms, 50);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_unparsable_environment_value_names_variable() {
        let err = WorkerConfig::default()
            .with_env_overrides(env(&[("SERVICEBUS_CONCURRENCY", "many")]))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, ref value, .. }
                if key == "SERVICEBUS_CONCURRENCY" && value == "many"
        ));
    }

    #[test]
    fn test_zero_concurrency_is_out_of_range() {
        let err = WorkerConfig::from_yaml("concurrency: 0\n").unwrap_err();

        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                key: "concurrency",
                ..
            }
        ));
    }

    #[test]
    fn test_retry_policy_retries_transient_kinds() {
        let policy = WorkerConfig::default().retry_policy().unwrap();

        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_millis(200));
        assert_eq!(
            policy.retryable(),
            &[
                ErrorKind::Concurrency,
                ErrorKind::Infrastructure,
                ErrorKind::Timeout
            ]
        );
    }
}
