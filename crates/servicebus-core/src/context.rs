//! The per-dispatch delivery context.
//!
//! A handler's only channel to the outside world: it publishes outbound
//! commands/events and writes log lines tied to the current trace id. The
//! context is a sink, so a handler may publish any number of messages while
//! it runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DomainError;
use crate::message::Message;
use crate::metadata::Metadata;

/// Severity of a context log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Unexpected but recoverable.
    Warning,
    /// Operation failed.
    Error,
}

/// Options attached to a single outbound publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Application headers added to the outbound metadata envelope.
    pub headers: BTreeMap<String, String>,
}

impl DeliveryOptions {
    /// Adds an application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the outbound envelope for a message produced under `parent`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ReservedMetadataKey` if a header uses the
    /// system-owned namespace.
    pub fn outbound_metadata(&self, parent: &Metadata) -> Result<Metadata, DomainError> {
        let mut metadata = parent.derive_outbound();
        for (key, value) in &self.headers {
            metadata = metadata.with_header(key.as_str(), value.as_str())?;
        }
        Ok(metadata)
    }
}

/// Context supplied by the caller for one dispatch.
#[async_trait]
pub trait DeliveryContext: Send + Sync {
    /// Metadata envelope of the message being handled.
    fn metadata(&self) -> &Metadata;

    /// Trace id of the current operation (nil when the envelope has none).
    fn trace_id(&self) -> Uuid {
        self.metadata().trace_id().unwrap_or_else(Uuid::nil)
    }

    /// Sends a message produced during handling.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be accepted for delivery.
    async fn publish(
        &self,
        message: Arc<dyn Message>,
        options: DeliveryOptions,
    ) -> Result<(), DomainError>;

    /// Writes a log line tied to the current operation.
    fn log(&self, message: &str, level: LogLevel, extra: &[(&str, &str)]) {
        emit_log(self.metadata(), message, level, extra);
    }
}

/// Emits a structured log line carrying the envelope's trace id and
/// message type.
pub fn emit_log(metadata: &Metadata, message: &str, level: LogLevel, extra: &[(&str, &str)]) {
    let trace_id = metadata.trace_id().unwrap_or_else(Uuid::nil);
    let message_type = metadata.message_type().unwrap_or("");
    match level {
        LogLevel::Debug => {
            tracing::debug!(%trace_id, message_type, ?extra, "{message}");
        }
        LogLevel::Info => {
            tracing::info!(%trace_id, message_type, ?extra, "{message}");
        }
        LogLevel::Warning => {
            tracing::warn!(%trace_id, message_type, ?extra, "{message}");
        }
        LogLevel::Error => {
            tracing::error!(%trace_id, message_type, ?extra, "{message}");
        }
    }
}

/// Publishes every message in order, stopping at the first failure.
///
/// # Errors
///
/// Returns the first publication error.
pub async fn publish_all(
    context: &dyn DeliveryContext,
    messages: impl IntoIterator<Item = Arc<dyn Message>> + Send,
) -> Result<(), DomainError> {
    for message in messages {
        context.publish(message, DeliveryOptions::default()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RETRY_COUNT;

    #[test]
    fn test_outbound_metadata_inherits_trace_and_adds_headers() {
        let trace_id = Uuid::new_v4();
        let parent = Metadata::new(trace_id).with_retry_count(2);
        let options = DeliveryOptions::default().with_header("tenant", "acme");

        let metadata = options.outbound_metadata(&parent).unwrap();

        assert_eq!(metadata.trace_id(), Some(trace_id));
        assert_eq!(metadata.get("tenant"), Some("acme"));
        assert_eq!(metadata.retry_count(), 0);
    }

    #[test]
    fn test_outbound_metadata_refuses_reserved_headers() {
        let options = DeliveryOptions::default().with_header(RETRY_COUNT, "9");

        let result = options.outbound_metadata(&Metadata::generate());

        assert!(matches!(result, Err(DomainError::ReservedMetadataKey(_))));
    }
}
