//! Lifecycle events published by the saga engine after a successful commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::message::{MessageContract, MessageKind};
use servicebus_core::serializer::MessageTypeRegistry;

use crate::identity::SagaStatus;

/// A saga instance was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaCreated {
    /// Saga type.
    pub saga_type: String,
    /// Saga identity value.
    pub saga_id: String,
    /// Start time.
    pub created_at: DateTime<Utc>,
    /// When the saga expires.
    pub expire_at: DateTime<Utc>,
}

impl MessageContract for SagaCreated {
    const MESSAGE_TYPE: &'static str = "servicebus.saga_created";
    const KIND: MessageKind = MessageKind::Event;
}

/// A saga moved to another status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStatusChanged {
    /// Saga type.
    pub saga_type: String,
    /// Saga identity value.
    pub saga_id: String,
    /// Previous status.
    pub from: SagaStatus,
    /// New status.
    pub to: SagaStatus,
    /// Why the status changed, when known.
    pub reason: Option<String>,
}

impl MessageContract for SagaStatusChanged {
    const MESSAGE_TYPE: &'static str = "servicebus.saga_status_changed";
    const KIND: MessageKind = MessageKind::Event;
}

/// A saga reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaClosed {
    /// Saga type.
    pub saga_type: String,
    /// Saga identity value.
    pub saga_id: String,
    /// Terminal status.
    pub status: SagaStatus,
    /// Closing reason, when known.
    pub reason: Option<String>,
    /// Closing time.
    pub closed_at: DateTime<Utc>,
}

impl MessageContract for SagaClosed {
    const MESSAGE_TYPE: &'static str = "servicebus.saga_closed";
    const KIND: MessageKind = MessageKind::Event;
}

/// Registers the saga lifecycle events for decoding.
pub fn register_lifecycle_events(registry: &mut MessageTypeRegistry) {
    registry
        .register::<SagaCreated>()
        .register::<SagaStatusChanged>()
        .register::<SagaClosed>();
}
