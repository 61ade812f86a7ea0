//! Transport contract and an in-process channel transport.
//!
//! A transport hands the worker raw deliveries and is told, once dispatch is
//! over, whether to accept, reject (dead-letter) or requeue each of them.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use servicebus_core::error::DomainError;
use servicebus_core::metadata::Metadata;
use servicebus_core::serializer::EncodedMessage;
use servicebus_dispatcher::bus::DispatchOutcome;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A payload received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingDelivery {
    /// Transport-assigned delivery tag.
    pub delivery_id: u64,
    /// Encoded envelope.
    pub payload: Vec<u8>,
    /// Metadata received with the payload.
    pub metadata: Metadata,
}

/// How a delivery is settled with the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Processing finished; drop the delivery.
    Accept,
    /// Processing cannot succeed; move the delivery to the dead letters.
    Reject {
        /// Human-readable cause.
        reason: String,
    },
    /// Processing may succeed later; deliver again with `metadata`.
    Requeue {
        /// Envelope for the redelivery.
        metadata: Metadata,
    },
}

impl Settlement {
    /// Settlement for a dispatch outcome.
    ///
    /// A rejected dispatch is requeued only when every failure is a
    /// concurrency conflict and the redelivery budget is not spent.
    #[must_use]
    pub fn for_outcome(outcome: &DispatchOutcome, max_redeliveries: u32) -> Self {
        match outcome {
            DispatchOutcome::Acknowledged { .. } => Self::Accept,
            DispatchOutcome::Unroutable { message_type } => Self::Reject {
                reason: format!("no handler registered for command {message_type}"),
            },
            DispatchOutcome::Rejected { failures, .. } => {
                let redelivery = failures
                    .iter()
                    .all(|f| f.is_transient())
                    .then(|| failures.iter().map(|f| f.metadata.retry_count()).max())
                    .flatten()
                    .filter(|retries| *retries < max_redeliveries)
                    .and_then(|_| failures.first());
                match redelivery {
                    Some(failure) => Self::Requeue {
                        metadata: failure.metadata.next_retry(),
                    },
                    None => Self::Reject {
                        reason: failures
                            .iter()
                            .map(|f| format!("{}: {}", f.handler, f.error))
                            .collect::<Vec<_>>()
                            .join("; "),
                    },
                }
            }
        }
    }
}

/// Source and sink of encoded messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Waits for the next delivery. `None` once the transport is closed and
    /// drained.
    async fn receive(&self) -> Option<IncomingDelivery>;

    /// Settles a delivery obtained from [`Transport::receive`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the transport is unavailable.
    async fn settle(
        &self,
        delivery: &IncomingDelivery,
        settlement: Settlement,
    ) -> Result<(), DomainError>;

    /// Sends an encoded message.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the transport is unavailable.
    async fn send(&self, message: EncodedMessage) -> Result<(), DomainError>;
}

/// A rejected delivery kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The rejected delivery.
    pub delivery: IncomingDelivery,
    /// Why it was rejected.
    pub reason: String,
}

/// In-process transport: sent messages are queued for local delivery.
#[derive(Debug)]
pub struct InMemoryTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<IncomingDelivery>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingDelivery>>,
    next_id: AtomicU64,
    sent: Mutex<Vec<EncodedMessage>>,
    accepted: AtomicU64,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Creates an open, empty transport.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            next_id: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            accepted: AtomicU64::new(0),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Takes the next queued delivery without waiting.
    pub async fn try_receive(&self) -> Option<IncomingDelivery> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Stops accepting messages; queued deliveries can still be received.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Every message sent, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<EncodedMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Namespaces of every message sent, in order.
    #[must_use]
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m.metadata.message_type().map(str::to_owned))
            .collect()
    }

    /// Deliveries settled with [`Settlement::Accept`].
    #[must_use]
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Deliveries settled with [`Settlement::Reject`].
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn enqueue(&self, payload: Vec<u8>, metadata: Metadata) -> Result<(), DomainError> {
        let delivery = IncomingDelivery {
            delivery_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            payload,
            metadata,
        };
        let sender = self
            .sender
            .lock()
            .map_err(|_| DomainError::Infrastructure("transport lock poisoned".to_owned()))?;
        sender
            .as_ref()
            .ok_or_else(|| DomainError::Infrastructure("transport is closed".to_owned()))?
            .send(delivery)
            .map_err(|_| DomainError::Infrastructure("transport receiver dropped".to_owned()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn receive(&self) -> Option<IncomingDelivery> {
        self.receiver.lock().await.recv().await
    }

    async fn settle(
        &self,
        delivery: &IncomingDelivery,
        settlement: Settlement,
    ) -> Result<(), DomainError> {
        match settlement {
            Settlement::Accept => {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                debug!(delivery_id = delivery.delivery_id, "Delivery accepted");
            }
            Settlement::Reject { reason } => {
                warn!(delivery_id = delivery.delivery_id, %reason, "Delivery dead-lettered");
                self.dead_letters
                    .lock()
                    .map_err(|_| DomainError::Infrastructure("transport lock poisoned".to_owned()))?
                    .push(DeadLetter {
                        delivery: delivery.clone(),
                        reason,
                    });
            }
            Settlement::Requeue { metadata } => {
                debug!(
                    delivery_id = delivery.delivery_id,
                    retry_count = metadata.retry_count(),
                    "Delivery requeued"
                );
                self.enqueue(delivery.payload.clone(), metadata)?;
            }
        }
        Ok(())
    }

    async fn send(&self, message: EncodedMessage) -> Result<(), DomainError> {
        self.enqueue(message.payload.clone(), message.metadata.clone())?;
        self.sent
            .lock()
            .map_err(|_| DomainError::Infrastructure("transport lock poisoned".to_owned()))?
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use servicebus_core::error::ErrorKind;
    use servicebus_dispatcher::bus::HandlerFailure;

    use super::*;

    fn encoded(body: &str) -> EncodedMessage {
        EncodedMessage {
            payload: body.as_bytes().to_vec(),
            metadata: Metadata::generate(),
        }
    }

    fn failure(error: DomainError, retry_count: u32) -> HandlerFailure {
        HandlerFailure {
            handler: "orders".to_owned(),
            attempts: 1,
            error,
            metadata: Metadata::generate()
                .with_retry_count(retry_count)
                .with_failure_origin("orders"),
        }
    }

    fn conflict() -> DomainError {
        DomainError::ConcurrentModification {
            id: "order-1".to_owned(),
            expected: Some(2),
            actual: Some(3),
        }
    }

    #[tokio::test]
    async fn test_sent_messages_are_delivered_in_order() {
        // Arrange
        let transport = InMemoryTransport::new();

        // Act
        transport.send(encoded("first")).await.unwrap();
        transport.send(encoded("second")).await.unwrap();

        // Assert
        let first = transport.receive().await.unwrap();
        let second = transport.receive().await.unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(second.payload, b"second");
        assert!(second.delivery_id > first.delivery_id);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_transport_drains_then_ends() {
        let transport = InMemoryTransport::new();
        transport.send(encoded("last")).await.unwrap();

        transport.close();

        assert!(transport.send(encoded("late")).await.is_err());
        assert!(transport.receive().await.is_some());
        assert!(transport.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_settlements_are_recorded() {
        let transport = InMemoryTransport::new();
        transport.send(encoded("a")).await.unwrap();
        let delivery = transport.receive().await.unwrap();

        transport.settle(&delivery, Settlement::Accept).await.unwrap();
        transport
            .settle(
                &delivery,
                Settlement::Reject {
                    reason: "bad".to_owned(),
                },
            )
            .await
            .unwrap();
        transport
            .settle(
                &delivery,
                Settlement::Requeue {
                    metadata: delivery.metadata.next_retry(),
                },
            )
            .await
            .unwrap();

        assert_eq!(transport.accepted_count(), 1);
        assert_eq!(transport.dead_letters()[0].reason, "bad");
        let redelivered = transport.try_receive().await.unwrap();
        assert_eq!(redelivered.payload, delivery.payload);
        assert_eq!(redelivered.metadata.retry_count(), 1);
    }

    #[test]
    fn test_conflicts_within_budget_are_requeued() {
        let outcome = DispatchOutcome::Rejected {
            handled: 0,
            failures: vec![failure(conflict(), 1)],
        };

        let settlement = Settlement::for_outcome(&outcome, 5);

        match settlement {
            Settlement::Requeue { metadata } => {
                assert_eq!(metadata.retry_count(), 2);
                assert_eq!(metadata.failure_origin(), Some("orders"));
            }
            other => panic!("expected requeue, got {other:?}"),
        }
    }

    #[test]
    fn test_conflicts_past_budget_are_rejected() {
        let outcome = DispatchOutcome::Rejected {
            handled: 0,
            failures: vec![failure(conflict(), 5)],
        };

        assert!(matches!(
            Settlement::for_outcome(&outcome, 5),
            Settlement::Reject { .. }
        ));
    }

    #[test]
    fn test_any_non_transient_failure_rejects() {
        let infrastructure = failure(DomainError::Infrastructure("db down".to_owned()), 0);
        assert_eq!(infrastructure.error.kind(), ErrorKind::Infrastructure);
        let outcome = DispatchOutcome::Rejected {
            handled: 1,
            failures: vec![failure(conflict(), 0), infrastructure],
        };

        let settlement = Settlement::for_outcome(&outcome, 5);

        assert_eq!(
            settlement,
            Settlement::Reject {
                reason: "orders: concurrent modification of order-1: expected version Some(2), found Some(3); orders: infrastructure error: db down"
                    .to_owned()
            }
        );
    }

    #[test]
    fn test_acknowledged_and_unroutable_outcomes() {
        let acknowledged = DispatchOutcome::Acknowledged {
            handled: 1,
            validation_failures: 0,
        };
        let unroutable = DispatchOutcome::Unroutable {
            message_type: "shop.place_order".to_owned(),
        };

        assert_eq!(Settlement::for_outcome(&acknowledged, 5), Settlement::Accept);
        assert_eq!(
            Settlement::for_outcome(&unroutable, 5),
            Settlement::Reject {
                reason: "no handler registered for command shop.place_order".to_owned()
            }
        );
    }
}
