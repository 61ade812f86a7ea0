//! Event stream storage.
//!
//! A stream is the ordered, append-only list of events of one aggregate.
//! Appends are version-checked: the writer states the playhead it expects at
//! the tail and the store fails with `ConcurrentModification` on mismatch.
//! An append either lands completely or not at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::error::DomainError;
use servicebus_core::identity::{AggregateId, Identity};
use servicebus_core::message::MessageContract;
use servicebus_core::time::{Clock, SystemClock};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::aggregate::AggregateClosed;

/// An event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Event namespace for deserialization routing.
    pub event_type: String,
    /// Normalized event fields.
    pub payload: serde_json::Value,
    /// When the event was raised.
    pub occurred_at: DateTime<Utc>,
}

/// An event as persisted in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Position in the stream, starting at 0.
    pub playhead: u64,
    /// Event namespace for deserialization routing.
    pub event_type: String,
    /// Normalized event fields.
    pub payload: serde_json::Value,
    /// When the event was raised.
    pub occurred_at: DateTime<Utc>,
    /// When the store accepted it.
    pub recorded_at: DateTime<Utc>,
}

/// Events of one aggregate plus the stream's state.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream {
    /// Aggregate the stream belongs to.
    pub id: AggregateId,
    /// Events in playhead order (possibly only a tail).
    pub events: Vec<StoredEvent>,
    /// Playhead of the last event in the whole stream.
    pub version: u64,
    /// Whether the stream rejects further appends.
    pub closed: bool,
}

/// The stream state a writer expects before appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not exist yet (creation).
    NoStream,
    /// The stream's last playhead must be exactly this.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation for a writer that last saw `version`.
    #[must_use]
    pub fn from_version(version: Option<u64>) -> Self {
        version.map_or(Self::NoStream, Self::Exact)
    }

    fn as_option(self) -> Option<u64> {
        match self {
            Self::NoStream => None,
            Self::Exact(v) => Some(v),
        }
    }
}

/// Append-only storage of aggregate event streams.
///
/// A stream is closed by appending an
/// [`AggregateClosed`](crate::aggregate::AggregateClosed) event; it is never
/// deleted.
#[async_trait]
pub trait EventStreamStore: Send + Sync {
    /// Appends `events` after the expected tail, assigning contiguous
    /// playheads.
    ///
    /// # Errors
    ///
    /// - `NonUniqueStreamId` when creating a stream that already exists.
    /// - `ClosedStream` when the stream was closed.
    /// - `ConcurrentModification` when the tail does not match `expected`.
    async fn append(
        &self,
        id: &AggregateId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads the whole stream, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn load(&self, id: &AggregateId) -> Result<Option<EventStream>, DomainError>;

    /// Loads the events with a playhead of at least `playhead`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn load_from_playhead(
        &self,
        id: &AggregateId,
        playhead: u64,
    ) -> Result<Option<EventStream>, DomainError>;
}

#[derive(Debug, Default)]
struct StreamRecord {
    events: Vec<StoredEvent>,
    closed: bool,
}

impl StreamRecord {
    fn version(&self) -> Option<u64> {
        self.events.last().map(|e| e.playhead)
    }

    fn to_stream(&self, id: &AggregateId, from: u64) -> Option<EventStream> {
        let version = self.version()?;
        Some(EventStream {
            id: id.clone(),
            events: self
                .events
                .iter()
                .filter(|e| e.playhead >= from)
                .cloned()
                .collect(),
            version,
            closed: self.closed,
        })
    }
}

/// In-process event stream store.
///
/// A single write lock covers each append, which makes the version check and
/// the write atomic.
pub struct InMemoryEventStreamStore {
    streams: RwLock<HashMap<String, StreamRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStreamStore {
    /// Creates an empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamping `recorded_at` from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of streams held.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for InMemoryEventStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStreamStore for InMemoryEventStreamStore {
    async fn append(
        &self,
        id: &AggregateId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let key = id.composite_key();
        let mut streams = self.streams.write().await;

        let actual = streams.get(&key).and_then(StreamRecord::version);
        if let Some(record) = streams.get(&key) {
            if expected == ExpectedVersion::NoStream {
                return Err(DomainError::NonUniqueStreamId(key));
            }
            if record.closed {
                return Err(DomainError::ClosedStream(key));
            }
        }
        if actual != expected.as_option() {
            warn!(stream = %key, ?expected, ?actual, "Event stream version conflict");
            return Err(DomainError::ConcurrentModification {
                id: key,
                expected: expected.as_option(),
                actual,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let recorded_at = self.clock.now();
        let first = actual.map_or(0, |v| v + 1);
        let stored: Vec<StoredEvent> = events
            .into_iter()
            .zip(first..)
            .map(|(event, playhead)| StoredEvent {
                event_id: event.event_id,
                playhead,
                event_type: event.event_type,
                payload: event.payload,
                occurred_at: event.occurred_at,
                recorded_at,
            })
            .collect();
        let closes = stored
            .iter()
            .any(|e| e.event_type == AggregateClosed::MESSAGE_TYPE);

        let record = streams.entry(key).or_default();
        record.events.extend(stored.iter().cloned());
        record.closed |= closes;
        Ok(stored)
    }

    async fn load(&self, id: &AggregateId) -> Result<Option<EventStream>, DomainError> {
        self.load_from_playhead(id, 0).await
    }

    async fn load_from_playhead(
        &self,
        id: &AggregateId,
        playhead: u64,
    ) -> Result<Option<EventStream>, DomainError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(&id.composite_key())
            .and_then(|record| record.to_stream(id, playhead)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use servicebus_test_support::FixedClock;

    use super::*;

    fn store() -> InMemoryEventStreamStore {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        InMemoryEventStreamStore::with_clock(Arc::new(FixedClock(now)))
    }

    fn id() -> AggregateId {
        AggregateId::new("account", "acc-1").unwrap()
    }

    fn event(event_type: &str) -> NewEvent {
        NewEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            payload: serde_json::json!({}),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_playheads() {
        // Arrange
        let store = store();
        store
            .append(&id(), ExpectedVersion::NoStream, vec![event("a"), event("b")])
            .await
            .unwrap();

        // Act
        let stored = store
            .append(&id(), ExpectedVersion::Exact(1), vec![event("c")])
            .await
            .unwrap();

        // Assert
        assert_eq!(stored[0].playhead, 2);
        let stream = store.load(&id()).await.unwrap().unwrap();
        let playheads: Vec<u64> = stream.events.iter().map(|e| e.playhead).collect();
        assert_eq!(playheads, vec![0, 1, 2]);
        assert_eq!(stream.version, 2);
    }

    #[tokio::test]
    async fn test_creating_existing_stream_fails() {
        let store = store();
        store
            .append(&id(), ExpectedVersion::NoStream, vec![event("a")])
            .await
            .unwrap();

        let err = store
            .append(&id(), ExpectedVersion::NoStream, vec![event("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::NonUniqueStreamId(key) if key == "account:acc-1"));
    }

    #[tokio::test]
    async fn test_stale_writer_gets_concurrent_modification() {
        let store = store();
        store
            .append(&id(), ExpectedVersion::NoStream, vec![event("a"), event("b")])
            .await
            .unwrap();

        let err = store
            .append(&id(), ExpectedVersion::Exact(0), vec![event("c")])
            .await
            .unwrap_err();

        match err {
            DomainError::ConcurrentModification {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(0));
                assert_eq!(actual, Some(1));
            }
            other => panic!("expected ConcurrentModification, got {other:?}"),
        }
        assert_eq!(store.load(&id()).await.unwrap().unwrap().events.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_appends() {
        let store = store();
        store
            .append(
                &id(),
                ExpectedVersion::NoStream,
                vec![event("a"), event(AggregateClosed::MESSAGE_TYPE)],
            )
            .await
            .unwrap();

        let err = store
            .append(&id(), ExpectedVersion::Exact(1), vec![event("b")])
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::ClosedStream(_)));
        assert!(store.load(&id()).await.unwrap().unwrap().closed);
    }

    #[tokio::test]
    async fn test_load_from_playhead_returns_tail_with_full_version() {
        let store = store();
        store
            .append(
                &id(),
                ExpectedVersion::NoStream,
                vec![event("a"), event("b"), event("c"), event("d")],
            )
            .await
            .unwrap();

        let tail = store.load_from_playhead(&id(), 2).await.unwrap().unwrap();

        assert_eq!(tail.events.len(), 2);
        assert_eq!(tail.events[0].playhead, 2);
        assert_eq!(tail.version, 3);
    }

    #[tokio::test]
    async fn test_missing_stream_loads_as_none() {
        let store = store();

        assert!(store.load(&id()).await.unwrap().is_none());
    }
}
