//! Aggregate contracts and the aggregate root container.
//!
//! Domain state is a plain serde struct implementing [`Aggregate`]. The
//! [`AggregateRoot`] wraps it with identity, version and the queue of
//! uncommitted events. State changes only by raising events: each raised
//! event is applied immediately and queued for the next append.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use servicebus_core::error::DomainError;
use servicebus_core::identity::{AggregateId, Identity};
use servicebus_core::message::{Message, MessageContract, MessageKind, denormalize};
use servicebus_core::time::Clock;
use uuid::Uuid;

use crate::store::{ExpectedVersion, NewEvent, StoredEvent};

/// A domain event produced by an aggregate.
///
/// Usually an enum whose variants wrap [`MessageContract`] events, so that
/// each variant can be published after it is persisted.
pub trait AggregateEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Namespace of this particular event.
    fn event_type(&self) -> &'static str;

    /// The event as a publishable message.
    fn to_message(&self) -> Arc<dyn Message>;
}

/// Domain state of an event-sourced aggregate.
pub trait Aggregate:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Aggregate type, used as the identity namespace.
    const AGGREGATE_TYPE: &'static str;

    /// Version of the serialized state layout. Snapshots taken under another
    /// schema are ignored.
    const SNAPSHOT_SCHEMA: u32 = 1;

    /// Events this aggregate raises and applies.
    type Event: AggregateEvent;

    /// State right after creation, before any domain event.
    fn initial(id: &AggregateId) -> Self;

    /// Applies one event. Must be deterministic and free of side effects.
    fn apply(&mut self, event: &Self::Event);
}

/// Implicit first event of every stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCreated {
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate identity value.
    pub aggregate_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl MessageContract for AggregateCreated {
    const MESSAGE_TYPE: &'static str = "servicebus.aggregate_created";
    const KIND: MessageKind = MessageKind::Event;
}

/// Last event of a closed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateClosed {
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate identity value.
    pub aggregate_id: String,
    /// Closing time.
    pub closed_at: DateTime<Utc>,
}

impl MessageContract for AggregateClosed {
    const MESSAGE_TYPE: &'static str = "servicebus.aggregate_closed";
    const KIND: MessageKind = MessageKind::Event;
}

/// A change queued on an aggregate root.
#[derive(Debug, Clone)]
pub enum Change<E> {
    /// Stream creation.
    Created(AggregateCreated),
    /// A domain event.
    Domain(E),
    /// Stream closing.
    Closed(AggregateClosed),
}

impl<E: AggregateEvent> Change<E> {
    /// Namespace of the change.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => AggregateCreated::MESSAGE_TYPE,
            Self::Domain(event) => event.event_type(),
            Self::Closed(_) => AggregateClosed::MESSAGE_TYPE,
        }
    }

    /// Normalized fields as stored in the stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the event cannot be normalized.
    pub fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        match self {
            Self::Created(event) => event.to_payload(),
            Self::Domain(event) => Ok(serde_json::to_value(event)?),
            Self::Closed(event) => event.to_payload(),
        }
    }

    /// The change as a publishable message.
    #[must_use]
    pub fn to_message(&self) -> Arc<dyn Message> {
        match self {
            Self::Created(event) => Arc::new(event.clone()),
            Self::Domain(event) => event.to_message(),
            Self::Closed(event) => Arc::new(event.clone()),
        }
    }
}

/// A raised event waiting to be appended.
#[derive(Debug, Clone)]
pub struct UncommittedEvent<E> {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Playhead the event will occupy.
    pub playhead: u64,
    /// The change itself.
    pub change: Change<E>,
    /// When it was raised.
    pub occurred_at: DateTime<Utc>,
}

impl<E: AggregateEvent> UncommittedEvent<E> {
    /// Converts into the store's append shape.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the event cannot be normalized.
    pub fn to_new_event(&self) -> Result<NewEvent, DomainError> {
        Ok(NewEvent {
            event_id: self.event_id,
            event_type: self.change.event_type().to_owned(),
            payload: self.change.to_payload()?,
            occurred_at: self.occurred_at,
        })
    }
}

/// Identity, version and pending changes around an aggregate's state.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    state: A,
    version: u64,
    persisted_version: Option<u64>,
    last_snapshot_version: Option<u64>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    uncommitted: Vec<UncommittedEvent<A::Event>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates a new aggregate, raising [`AggregateCreated`] at playhead 0.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `id` belongs to another aggregate
    /// type.
    pub fn create(id: AggregateId, clock: &dyn Clock) -> Result<Self, DomainError> {
        ensure_type::<A>(&id)?;
        let now = clock.now();
        let created = AggregateCreated {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            aggregate_id: id.as_str().to_owned(),
            created_at: now,
        };
        let state = A::initial(&id);
        Ok(Self {
            id,
            state,
            version: 0,
            persisted_version: None,
            last_snapshot_version: None,
            created_at: now,
            closed_at: None,
            uncommitted: vec![UncommittedEvent {
                event_id: Uuid::now_v7(),
                playhead: 0,
                change: Change::Created(created),
                occurred_at: now,
            }],
        })
    }

    /// Rebuilds an aggregate from its full stream without queuing anything.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the stream does not start with
    /// a creation event, has gaps, or holds undecodable events.
    pub fn restore(id: AggregateId, events: &[StoredEvent]) -> Result<Self, DomainError> {
        ensure_type::<A>(&id)?;
        let (first, rest) = events.split_first().ok_or_else(|| {
            DomainError::Serialization(format!("event stream {id} is empty"))
        })?;
        if first.playhead != 0 || first.event_type != AggregateCreated::MESSAGE_TYPE {
            return Err(DomainError::Serialization(format!(
                "event stream {id} does not start with {}",
                AggregateCreated::MESSAGE_TYPE
            )));
        }
        let created: AggregateCreated = denormalize(first.payload.clone())?;
        let state = A::initial(&id);
        let mut root = Self {
            id,
            state,
            version: 0,
            persisted_version: Some(0),
            last_snapshot_version: None,
            created_at: created.created_at,
            closed_at: None,
            uncommitted: Vec::new(),
        };
        replay(&mut root, rest)?;
        Ok(root)
    }

    /// Rebuilds an aggregate from snapshotted state at `version`. The
    /// remaining events must then be replayed with [`replay`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `id` belongs to another aggregate
    /// type.
    pub fn from_snapshot(
        id: AggregateId,
        state: A,
        version: u64,
        created_at: DateTime<Utc>,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, DomainError> {
        ensure_type::<A>(&id)?;
        Ok(Self {
            id,
            state,
            version,
            persisted_version: Some(version),
            last_snapshot_version: Some(version),
            created_at,
            closed_at,
            uncommitted: Vec::new(),
        })
    }

    /// Applies `event` and queues it for persistence.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ClosedStream` if the aggregate was closed.
    pub fn raise(&mut self, event: A::Event, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.state.apply(&event);
        self.enqueue(Change::Domain(event), clock.now());
        Ok(())
    }

    /// Closes the stream; later raises fail with `ClosedStream`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ClosedStream` if the aggregate is already closed.
    pub fn close(&mut self, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_open()?;
        let now = clock.now();
        self.closed_at = Some(now);
        self.enqueue(
            Change::Closed(AggregateClosed {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                aggregate_id: self.id.as_str().to_owned(),
                closed_at: now,
            }),
            now,
        );
        Ok(())
    }

    /// Aggregate identity.
    #[must_use]
    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Domain state.
    #[must_use]
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Playhead of the last applied event.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version the store is known to hold (`None` before the first append).
    #[must_use]
    pub fn persisted_version(&self) -> Option<u64> {
        self.persisted_version
    }

    /// Version of the last snapshot known for this aggregate.
    #[must_use]
    pub fn last_snapshot_version(&self) -> Option<u64> {
        self.last_snapshot_version
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Closing time, if closed.
    #[must_use]
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Whether the stream is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Events raised since the last append.
    #[must_use]
    pub fn uncommitted(&self) -> &[UncommittedEvent<A::Event>] {
        &self.uncommitted
    }

    /// What the store must hold for the pending events to be appended.
    #[must_use]
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::from_version(self.persisted_version)
    }

    /// Marks every pending event as persisted and returns them.
    pub fn mark_committed(&mut self) -> Vec<UncommittedEvent<A::Event>> {
        self.persisted_version = Some(self.version);
        std::mem::take(&mut self.uncommitted)
    }

    /// Records that a snapshot was taken at the current version.
    pub fn mark_snapshotted(&mut self) {
        self.last_snapshot_version = Some(self.version);
    }

    pub(crate) fn forget_snapshot(&mut self) {
        self.last_snapshot_version = None;
    }

    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.is_closed() {
            return Err(DomainError::ClosedStream(self.id.composite_key()));
        }
        Ok(())
    }

    fn enqueue(&mut self, change: Change<A::Event>, occurred_at: DateTime<Utc>) {
        self.version += 1;
        self.uncommitted.push(UncommittedEvent {
            event_id: Uuid::now_v7(),
            playhead: self.version,
            change,
            occurred_at,
        });
    }
}

/// Replays stored events onto `root` in playhead order without queuing them.
///
/// # Errors
///
/// Returns `DomainError::Serialization` on a playhead gap, an event after the
/// stream was closed, or an undecodable payload.
pub fn replay<A: Aggregate>(
    root: &mut AggregateRoot<A>,
    events: &[StoredEvent],
) -> Result<(), DomainError> {
    for event in events {
        let expected = root.version + 1;
        if event.playhead != expected {
            return Err(DomainError::Serialization(format!(
                "event stream {} jumps from playhead {} to {}",
                root.id, root.version, event.playhead
            )));
        }
        if root.is_closed() {
            return Err(DomainError::Serialization(format!(
                "event stream {} continues after being closed",
                root.id
            )));
        }
        if event.event_type == AggregateClosed::MESSAGE_TYPE {
            let closed: AggregateClosed = denormalize(event.payload.clone())?;
            root.closed_at = Some(closed.closed_at);
        } else {
            let domain: A::Event = serde_json::from_value(event.payload.clone()).map_err(|e| {
                DomainError::Serialization(format!(
                    "event {} at playhead {} of {} could not be decoded: {e}",
                    event.event_type, event.playhead, root.id
                ))
            })?;
            root.state.apply(&domain);
        }
        root.version = event.playhead;
        root.persisted_version = Some(event.playhead);
    }
    Ok(())
}

fn ensure_type<A: Aggregate>(id: &AggregateId) -> Result<(), DomainError> {
    if id.aggregate_type() != A::AGGREGATE_TYPE {
        return Err(DomainError::Validation(format!(
            "identity {id} does not belong to aggregate type {}",
            A::AGGREGATE_TYPE
        )));
    }
    Ok(())
}
