//! Delivery context backed by a transport.

use std::sync::Arc;

use async_trait::async_trait;
use servicebus_core::context::{DeliveryContext, DeliveryOptions};
use servicebus_core::error::DomainError;
use servicebus_core::message::Message;
use servicebus_core::metadata::Metadata;
use servicebus_core::serializer::MessageSerializer;

use crate::transport::Transport;

/// Encodes published messages and hands them to the transport.
pub struct TransportDeliveryContext {
    metadata: Metadata,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn MessageSerializer>,
}

impl TransportDeliveryContext {
    /// Context for the delivery whose envelope is `metadata`.
    #[must_use]
    pub fn new(
        metadata: Metadata,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Self {
        Self {
            metadata,
            transport,
            serializer,
        }
    }
}

impl std::fmt::Debug for TransportDeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportDeliveryContext")
            .field("metadata", &self.metadata)
            .field("serializer", &self.serializer.kind())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeliveryContext for TransportDeliveryContext {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn publish(
        &self,
        message: Arc<dyn Message>,
        options: DeliveryOptions,
    ) -> Result<(), DomainError> {
        let metadata = options.outbound_metadata(&self.metadata)?;
        let encoded = self.serializer.encode(message.as_ref(), &metadata)?;
        self.transport.send(encoded).await
    }
}

#[cfg(test)]
mod tests {
    use servicebus_core::serializer::{JsonMessageSerializer, MessageTypeRegistry};
    use servicebus_core::validation::MessageValidationFailed;
    use uuid::Uuid;

    use super::*;
    use crate::transport::InMemoryTransport;

    #[tokio::test]
    async fn test_published_message_inherits_trace_and_headers() {
        // Arrange
        let trace_id = Uuid::new_v4();
        let inbound = Metadata::new(trace_id).with_retry_count(2);
        let transport = Arc::new(InMemoryTransport::new());
        let serializer = Arc::new(JsonMessageSerializer::new(Arc::new(
            MessageTypeRegistry::new(),
        )));
        let context = TransportDeliveryContext::new(inbound, transport.clone(), serializer);

        // Act
        context
            .publish(
                Arc::new(MessageValidationFailed::new(trace_id, "shop.place_order", &[])),
                DeliveryOptions::default().with_header("tenant", "acme"),
            )
            .await
            .unwrap();

        // Assert
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let metadata = &sent[0].metadata;
        assert_eq!(metadata.trace_id(), Some(trace_id));
        assert_eq!(metadata.retry_count(), 0);
        assert_eq!(metadata.get("tenant"), Some("acme"));
        assert_eq!(metadata.serializer(), Some(JsonMessageSerializer::KIND));
    }
}
