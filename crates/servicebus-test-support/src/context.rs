//! Test delivery contexts: `DeliveryContext` doubles that record or fail.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use servicebus_core::context::{DeliveryContext, DeliveryOptions, LogLevel};
use servicebus_core::error::DomainError;
use servicebus_core::message::{Message, MessageContract, downcast};
use servicebus_core::metadata::Metadata;
use uuid::Uuid;

/// A message captured by [`RecordingDeliveryContext`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// The published message.
    pub message: Arc<dyn Message>,
    /// Options it was published with.
    pub options: DeliveryOptions,
}

/// A delivery context that records every publication and log line.
#[derive(Debug)]
pub struct RecordingDeliveryContext {
    metadata: Metadata,
    published: Mutex<Vec<PublishedMessage>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingDeliveryContext {
    /// Create a context for a delivery traced by `trace_id`.
    #[must_use]
    pub fn new(trace_id: Uuid) -> Self {
        Self::with_metadata(Metadata::new(trace_id))
    }

    /// Create a context around existing metadata.
    #[must_use]
    pub fn with_metadata(metadata: Metadata) -> Self {
        Self {
            metadata,
            published: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Create a context with a fresh trace id, wrapped for handler calls.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::with_metadata(Metadata::generate()))
    }

    /// Returns every publication, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Returns the namespaces of every publication, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published_types(&self) -> Vec<&'static str> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.message.message_type())
            .collect()
    }

    /// Returns the published messages of type `M`, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published_of<M: MessageContract>(&self) -> Vec<M> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| downcast::<M>(p.message.as_ref()).cloned())
            .collect()
    }

    /// Returns every log line, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryContext for RecordingDeliveryContext {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn publish(
        &self,
        message: Arc<dyn Message>,
        options: DeliveryOptions,
    ) -> Result<(), DomainError> {
        self.published
            .lock()
            .unwrap()
            .push(PublishedMessage { message, options });
        Ok(())
    }

    fn log(&self, message: &str, level: LogLevel, _extra: &[(&str, &str)]) {
        self.logs.lock().unwrap().push((level, message.to_owned()));
    }
}

/// A delivery context whose transport is down. Useful for testing that
/// persistence happens before publication.
#[derive(Debug, Default)]
pub struct FailingDeliveryContext {
    metadata: Metadata,
}

impl FailingDeliveryContext {
    /// Create a failing context with a fresh trace id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata: Metadata::generate(),
        }
    }
}

#[async_trait]
impl DeliveryContext for FailingDeliveryContext {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn publish(
        &self,
        _message: Arc<dyn Message>,
        _options: DeliveryOptions,
    ) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("transport unavailable".into()))
    }
}
