//! Scheduled operations: commands emitted at a later date.
//!
//! Operations are persisted through a [`SchedulerStore`] with the same
//! duplicate and not-found guards as the saga store. A periodic call to
//! [`Scheduler::emit_due`] extracts every due operation, rebuilds its command
//! and publishes it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::context::{DeliveryContext, DeliveryOptions};
use servicebus_core::error::DomainError;
use servicebus_core::message::{Message, MessageContract, MessageKind};
use servicebus_core::serializer::MessageTypeRegistry;
use servicebus_core::time::{Clock, RelativeOffset};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A command waiting for its execution date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOperation {
    /// Operation identifier.
    pub id: Uuid,
    /// Namespace of the command to emit.
    pub command_type: String,
    /// Normalized command fields.
    pub payload: serde_json::Value,
    /// When the command should be emitted.
    pub execute_at: DateTime<Utc>,
    /// When the operation was scheduled.
    pub scheduled_at: DateTime<Utc>,
}

/// An operation was scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationScheduled {
    /// Operation identifier.
    pub operation_id: Uuid,
    /// Namespace of the scheduled command.
    pub command_type: String,
    /// Execution date.
    pub execute_at: DateTime<Utc>,
}

impl MessageContract for OperationScheduled {
    const MESSAGE_TYPE: &'static str = "servicebus.operation_scheduled";
    const KIND: MessageKind = MessageKind::Event;
}

/// A scheduled operation was canceled before its execution date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledOperationCanceled {
    /// Operation identifier.
    pub operation_id: Uuid,
    /// Namespace of the canceled command.
    pub command_type: String,
}

impl MessageContract for ScheduledOperationCanceled {
    const MESSAGE_TYPE: &'static str = "servicebus.scheduled_operation_canceled";
    const KIND: MessageKind = MessageKind::Event;
}

/// A scheduled command was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledOperationEmitted {
    /// Operation identifier.
    pub operation_id: Uuid,
    /// Namespace of the emitted command.
    pub command_type: String,
}

impl MessageContract for ScheduledOperationEmitted {
    const MESSAGE_TYPE: &'static str = "servicebus.scheduled_operation_emitted";
    const KIND: MessageKind = MessageKind::Event;
}

/// Registers the scheduler events for decoding.
pub fn register_scheduler_events(registry: &mut MessageTypeRegistry) {
    registry
        .register::<OperationScheduled>()
        .register::<ScheduledOperationCanceled>()
        .register::<ScheduledOperationEmitted>();
}

/// Persistence for scheduled operations.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Stores a new operation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::DuplicateScheduledOperation` if the id is taken.
    async fn add(&self, operation: ScheduledOperation) -> Result<(), DomainError>;

    /// Deletes an operation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ScheduledOperationNotFound` if it does not exist.
    async fn remove(&self, id: Uuid) -> Result<(), DomainError>;

    /// Deletes an operation and returns it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ScheduledOperationNotFound` if it does not exist.
    async fn extract(&self, id: Uuid) -> Result<ScheduledOperation, DomainError>;

    /// Operations whose execution date is not after `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledOperation>, DomainError>;
}

/// In-process scheduler store.
#[derive(Debug, Default)]
pub struct InMemorySchedulerStore {
    operations: RwLock<HashMap<Uuid, ScheduledOperation>>,
}

impl InMemorySchedulerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending operations.
    pub async fn pending_count(&self) -> usize {
        self.operations.read().await.len()
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn add(&self, operation: ScheduledOperation) -> Result<(), DomainError> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.id) {
            return Err(DomainError::DuplicateScheduledOperation(operation.id.to_string()));
        }
        operations.insert(operation.id, operation);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), DomainError> {
        self.extract(id).await.map(|_| ())
    }

    async fn extract(&self, id: Uuid) -> Result<ScheduledOperation, DomainError> {
        self.operations
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| DomainError::ScheduledOperationNotFound(id.to_string()))
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledOperation>, DomainError> {
        let mut due: Vec<ScheduledOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| op.execute_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|op| (op.execute_at, op.scheduled_at));
        Ok(due)
    }
}

/// Schedules, cancels and emits delayed commands.
pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    registry: Arc<MessageTypeRegistry>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Creates a scheduler. `registry` must know every command that can be
    /// scheduled.
    #[must_use]
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        registry: Arc<MessageTypeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Schedules `command` to be emitted after `delay`.
    ///
    /// # Errors
    ///
    /// `DomainError::Configuration` if `delay` lands outside the representable
    /// date range, otherwise see [`Scheduler::schedule_at`].
    pub async fn schedule<C: MessageContract>(
        &self,
        command: &C,
        delay: RelativeOffset,
        context: &dyn DeliveryContext,
    ) -> Result<Uuid, DomainError> {
        let execute_at = delay.apply(self.clock.now())?;
        self.schedule_at(command, execute_at, context).await
    }

    /// Schedules `command` to be emitted at `execute_at`.
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation` if `C` is not a command.
    /// - `DomainError::Serialization` if `C` is not registered for decoding.
    /// - Any store or publication error.
    pub async fn schedule_at<C: MessageContract>(
        &self,
        command: &C,
        execute_at: DateTime<Utc>,
        context: &dyn DeliveryContext,
    ) -> Result<Uuid, DomainError> {
        if C::KIND != MessageKind::Command {
            return Err(DomainError::Validation(format!(
                "only commands can be scheduled, {} is an event",
                C::MESSAGE_TYPE
            )));
        }
        if !self.registry.contains(C::MESSAGE_TYPE) {
            return Err(DomainError::Serialization(format!(
                "{} is not registered for decoding and could never be emitted",
                C::MESSAGE_TYPE
            )));
        }
        let operation = ScheduledOperation {
            id: Uuid::now_v7(),
            command_type: C::MESSAGE_TYPE.to_owned(),
            payload: command.to_payload()?,
            execute_at,
            scheduled_at: self.clock.now(),
        };
        let id = operation.id;
        self.store.add(operation).await?;
        debug!(operation = %id, command_type = C::MESSAGE_TYPE, %execute_at, "Operation scheduled");
        context
            .publish(
                Arc::new(OperationScheduled {
                    operation_id: id,
                    command_type: C::MESSAGE_TYPE.to_owned(),
                    execute_at,
                }),
                DeliveryOptions::default(),
            )
            .await?;
        Ok(id)
    }

    /// Cancels a pending operation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ScheduledOperationNotFound` if it does not exist
    /// (already emitted or canceled).
    pub async fn cancel(&self, id: Uuid, context: &dyn DeliveryContext) -> Result<(), DomainError> {
        let operation = self.store.extract(id).await?;
        debug!(operation = %id, command_type = %operation.command_type, "Operation canceled");
        context
            .publish(
                Arc::new(ScheduledOperationCanceled {
                    operation_id: id,
                    command_type: operation.command_type,
                }),
                DeliveryOptions::default(),
            )
            .await
    }

    /// Emits every due operation, oldest first. Returns how many were emitted.
    ///
    /// An operation is extracted before its command is published, so a
    /// concurrent run cannot emit it twice. If the command cannot be decoded
    /// or published the operation is put back and the next run retries it.
    ///
    /// # Errors
    ///
    /// Returns the first store, decoding or publication error; operations
    /// emitted before it stay emitted.
    pub async fn emit_due(&self, context: &dyn DeliveryContext) -> Result<usize, DomainError> {
        let due = self.store.due(self.clock.now()).await?;
        let mut emitted = 0;
        for pending in due {
            let operation = match self.store.extract(pending.id).await {
                Ok(operation) => operation,
                Err(DomainError::ScheduledOperationNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if let Err(e) = self.publish_command(&operation, context).await {
                self.restore(operation).await;
                return Err(e);
            }
            context
                .publish(
                    Arc::new(ScheduledOperationEmitted {
                        operation_id: operation.id,
                        command_type: operation.command_type,
                    }),
                    DeliveryOptions::default(),
                )
                .await?;
            emitted += 1;
        }
        if emitted > 0 {
            info!(emitted, "Scheduled operations emitted");
        }
        Ok(emitted)
    }

    async fn publish_command(
        &self,
        operation: &ScheduledOperation,
        context: &dyn DeliveryContext,
    ) -> Result<(), DomainError> {
        let command: Arc<dyn Message> = self
            .registry
            .decode(&operation.command_type, operation.payload.clone())?;
        context.publish(command, DeliveryOptions::default()).await
    }

    async fn restore(&self, operation: ScheduledOperation) {
        let id = operation.id;
        match self.store.add(operation).await {
            Ok(()) => debug!(operation = %id, "Operation kept for the next run"),
            Err(e) => warn!(operation = %id, error = %e, "Failed to restore scheduled operation"),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use servicebus_test_support::{FailingDeliveryContext, ManualClock, RecordingDeliveryContext};

    use super::*;
    use crate::test_fixtures::{OrderShipped, ShipOrder, start_of_day};

    fn scheduler(clock: Arc<ManualClock>) -> (Scheduler, Arc<InMemorySchedulerStore>) {
        let store = Arc::new(InMemorySchedulerStore::new());
        let mut registry = MessageTypeRegistry::new();
        registry.register::<ShipOrder>();
        register_scheduler_events(&mut registry);
        (
            Scheduler::new(store.clone(), Arc::new(registry), clock),
            store,
        )
    }

    fn ship(order_id: &str) -> ShipOrder {
        ShipOrder {
            order_id: order_id.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_due_operations_are_emitted_once_in_date_order() {
        // Arrange
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, store) = scheduler(clock.clone());
        let ctx = RecordingDeliveryContext::shared();
        let offset = |s: &str| RelativeOffset::parse(s).unwrap();
        scheduler.schedule(&ship("late"), offset("+30 minutes"), ctx.as_ref()).await.unwrap();
        scheduler.schedule(&ship("early"), offset("+10 minutes"), ctx.as_ref()).await.unwrap();
        scheduler.schedule(&ship("never"), offset("+1 day"), ctx.as_ref()).await.unwrap();
        clock.advance(Duration::hours(1));

        // Act
        let first = scheduler.emit_due(ctx.as_ref()).await.unwrap();
        let second = scheduler.emit_due(ctx.as_ref()).await.unwrap();

        // Assert
        assert_eq!((first, second), (2, 0));
        let shipped: Vec<String> = ctx
            .published_of::<ShipOrder>()
            .into_iter()
            .map(|c| c.order_id)
            .collect();
        assert_eq!(shipped, vec!["early", "late"]);
        assert_eq!(ctx.published_of::<ScheduledOperationEmitted>().len(), 2);
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_emission_keeps_operation_for_next_run() {
        // Arrange
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, store) = scheduler(clock.clone());
        let ctx = RecordingDeliveryContext::shared();
        let id = scheduler
            .schedule(&ship("o-9"), RelativeOffset::from_seconds(60), ctx.as_ref())
            .await
            .unwrap();
        clock.advance(Duration::hours(1));

        // Act
        let err = scheduler
            .emit_due(&FailingDeliveryContext::new())
            .await
            .unwrap_err();
        let pending_after_failure = store.pending_count().await;
        let retried = scheduler.emit_due(ctx.as_ref()).await.unwrap();

        // Assert
        assert!(matches!(err, DomainError::Infrastructure(_)));
        assert_eq!(pending_after_failure, 1);
        assert_eq!(retried, 1);
        assert_eq!(ctx.published_of::<ShipOrder>(), vec![ship("o-9")]);
        let emitted = ctx.published_of::<ScheduledOperationEmitted>();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].operation_id, id);
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_delay_past_date_range_is_rejected() {
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, store) = scheduler(clock);
        let ctx = RecordingDeliveryContext::shared();

        let err = scheduler
            .schedule(&ship("o-1"), RelativeOffset::from_seconds(i64::MAX), ctx.as_ref())
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Configuration(_)));
        assert_eq!(store.pending_count().await, 0);
        assert!(ctx.published().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_publishes_event_with_execution_date() {
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, _store) = scheduler(clock);
        let ctx = RecordingDeliveryContext::shared();

        let id = scheduler
            .schedule(&ship("o-1"), RelativeOffset::from_seconds(90), ctx.as_ref())
            .await
            .unwrap();

        let scheduled = ctx.published_of::<OperationScheduled>();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].operation_id, id);
        assert_eq!(scheduled[0].execute_at, start_of_day() + Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_cancel_removes_operation_and_second_cancel_fails() {
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, store) = scheduler(clock.clone());
        let ctx = RecordingDeliveryContext::shared();
        let id = scheduler
            .schedule(&ship("o-1"), RelativeOffset::from_seconds(60), ctx.as_ref())
            .await
            .unwrap();

        scheduler.cancel(id, ctx.as_ref()).await.unwrap();
        let err = scheduler.cancel(id, ctx.as_ref()).await.unwrap_err();
        clock.advance(Duration::hours(1));

        assert!(matches!(err, DomainError::ScheduledOperationNotFound(_)));
        assert_eq!(store.pending_count().await, 0);
        assert_eq!(scheduler.emit_due(ctx.as_ref()).await.unwrap(), 0);
        assert_eq!(ctx.published_of::<ScheduledOperationCanceled>().len(), 1);
    }

    #[tokio::test]
    async fn test_events_and_unregistered_commands_cannot_be_scheduled() {
        let clock = Arc::new(ManualClock::new(start_of_day()));
        let (scheduler, store) = scheduler(clock);
        let ctx = RecordingDeliveryContext::shared();
        let later = start_of_day() + Duration::hours(1);
        let event = OrderShipped {
            order_id: "o-1".to_owned(),
        };
        let unregistered = crate::test_fixtures::place_order("o-1");

        let event_err = scheduler.schedule_at(&event, later, ctx.as_ref()).await.unwrap_err();
        let decode_err = scheduler
            .schedule_at(&unregistered, later, ctx.as_ref())
            .await
            .unwrap_err();

        assert!(matches!(event_err, DomainError::Validation(_)));
        assert!(matches!(decode_err, DomainError::Serialization(_)));
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_ids() {
        let store = InMemorySchedulerStore::new();
        let operation = ScheduledOperation {
            id: Uuid::now_v7(),
            command_type: ShipOrder::MESSAGE_TYPE.to_owned(),
            payload: serde_json::json!({ "order_id": "o-1" }),
            execute_at: start_of_day(),
            scheduled_at: start_of_day(),
        };
        store.add(operation.clone()).await.unwrap();

        let err = store.add(operation).await.unwrap_err();

        assert!(matches!(err, DomainError::DuplicateScheduledOperation(_)));
    }
}
