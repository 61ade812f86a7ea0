//! Attempt-scoped delivery context.
//!
//! Each handler attempt gets its own context. Publications are buffered and
//! only handed to the caller's context once the attempt succeeds, so a failed
//! or abandoned attempt leaves no trace downstream.

use std::sync::Arc;

use async_trait::async_trait;
use servicebus_core::context::{DeliveryContext, DeliveryOptions, LogLevel};
use servicebus_core::error::DomainError;
use servicebus_core::message::Message;
use servicebus_core::metadata::Metadata;
use tokio::sync::Mutex;

/// A message published during an attempt, not yet flushed.
pub type Buffered = (Arc<dyn Message>, DeliveryOptions);

/// Delivery context for one handler attempt.
pub struct AttemptContext {
    parent: Arc<dyn DeliveryContext>,
    metadata: Metadata,
    handler: String,
    buffer: Mutex<Vec<Buffered>>,
}

impl AttemptContext {
    /// Creates the context for attempt `attempt` (1-based) of `handler`.
    ///
    /// The envelope seen by the handler carries the inbound retry count plus
    /// the retries made by this dispatch.
    #[must_use]
    pub fn new(parent: Arc<dyn DeliveryContext>, handler: impl Into<String>, attempt: u32) -> Self {
        let inbound = parent.metadata();
        let metadata =
            inbound.with_retry_count(inbound.retry_count().saturating_add(attempt.saturating_sub(1)));
        Self {
            parent,
            metadata,
            handler: handler.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Takes the buffered publications, in publication order.
    pub async fn take(&self) -> Vec<Buffered> {
        std::mem::take(&mut *self.buffer.lock().await)
    }

    /// Publishes `buffered` through the caller's context, in order.
    ///
    /// # Errors
    ///
    /// Returns the first publication error.
    pub async fn flush(parent: &dyn DeliveryContext, buffered: Vec<Buffered>) -> Result<(), DomainError> {
        for (message, options) in buffered {
            parent.publish(message, options).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("handler", &self.handler)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeliveryContext for AttemptContext {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn publish(
        &self,
        message: Arc<dyn Message>,
        options: DeliveryOptions,
    ) -> Result<(), DomainError> {
        // Reserved headers are rejected now rather than at flush time.
        options.outbound_metadata(&self.metadata)?;
        self.buffer.lock().await.push((message, options));
        Ok(())
    }

    fn log(&self, message: &str, level: LogLevel, extra: &[(&str, &str)]) {
        let mut fields = Vec::with_capacity(extra.len() + 1);
        fields.push(("handler", self.handler.as_str()));
        fields.extend_from_slice(extra);
        self.parent.log(message, level, &fields);
    }
}
