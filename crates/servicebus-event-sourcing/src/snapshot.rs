//! Aggregate snapshots.
//!
//! A snapshot is a cache: losing it, or failing to decode it, only costs a
//! full replay. The state is stored as explicit serde fields tagged with the
//! aggregate's [`SNAPSHOT_SCHEMA`](crate::aggregate::Aggregate::SNAPSHOT_SCHEMA)
//! so layout changes invalidate old snapshots instead of corrupting state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::error::DomainError;
use servicebus_core::identity::{AggregateId, Identity};
use servicebus_core::time::Clock;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::aggregate::{Aggregate, AggregateRoot};

/// Default number of versions between snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 10;

/// Materialized aggregate state at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: AggregateId,
    /// Playhead of the last event folded into `state`.
    pub version: u64,
    /// Layout version of `state`.
    pub schema_version: u32,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// Aggregate creation time.
    pub created_at: DateTime<Utc>,
    /// Aggregate closing time, if closed at `version`.
    pub closed_at: Option<DateTime<Utc>>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Keyed persistence for the latest snapshot of each aggregate.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `snapshot`, replacing any previous one for the aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError>;

    /// Latest snapshot of `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn load(&self, id: &AggregateId) -> Result<Option<Snapshot>, DomainError>;

    /// Drops the snapshot of `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn remove(&self, id: &AggregateId) -> Result<(), DomainError>;
}

/// In-process snapshot store.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots held.
    pub async fn stored_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let key = snapshot.aggregate_id.composite_key();
        self.snapshots.write().await.insert(key, snapshot);
        Ok(())
    }

    async fn load(&self, id: &AggregateId) -> Result<Option<Snapshot>, DomainError> {
        Ok(self.snapshots.read().await.get(&id.composite_key()).cloned())
    }

    async fn remove(&self, id: &AggregateId) -> Result<(), DomainError> {
        self.snapshots.write().await.remove(&id.composite_key());
        Ok(())
    }
}

/// Decides whether a snapshot should be taken after an append.
pub trait SnapshotTrigger: Send + Sync {
    /// `current_version` is the aggregate's version after the append;
    /// `last_snapshot_version` is the version of the previous snapshot.
    fn snapshot_must_be_created(&self, current_version: u64, last_snapshot_version: Option<u64>)
    -> bool;
}

/// Snapshots every `step` versions; always when no snapshot exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionIncreaseTrigger {
    step: u64,
}

impl VersionIncreaseTrigger {
    /// Creates a trigger firing every `step` versions (at least 1).
    #[must_use]
    pub fn new(step: u64) -> Self {
        Self { step: step.max(1) }
    }

    /// The configured interval.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }
}

impl Default for VersionIncreaseTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

impl SnapshotTrigger for VersionIncreaseTrigger {
    fn snapshot_must_be_created(
        &self,
        current_version: u64,
        last_snapshot_version: Option<u64>,
    ) -> bool {
        last_snapshot_version
            .is_none_or(|previous| current_version.saturating_sub(previous) >= self.step)
    }
}

/// Takes and restores snapshots for aggregates.
pub struct Snapshotter {
    store: Arc<dyn SnapshotStore>,
    trigger: Arc<dyn SnapshotTrigger>,
    clock: Arc<dyn Clock>,
}

impl Snapshotter {
    /// Creates a snapshotter.
    #[must_use]
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        trigger: Arc<dyn SnapshotTrigger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            trigger,
            clock,
        }
    }

    /// Whether the trigger asks for a snapshot of `root` now.
    #[must_use]
    pub fn is_due<A: Aggregate>(&self, root: &AggregateRoot<A>) -> bool {
        self.trigger
            .snapshot_must_be_created(root.version(), root.last_snapshot_version())
    }

    /// Stores a snapshot of `root` at its current version.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized or stored.
    pub async fn take<A: Aggregate>(&self, root: &AggregateRoot<A>) -> Result<Snapshot, DomainError> {
        let snapshot = Snapshot {
            aggregate_id: root.id().clone(),
            version: root.version(),
            schema_version: A::SNAPSHOT_SCHEMA,
            state: serde_json::to_value(root.state())?,
            created_at: root.created_at(),
            closed_at: root.closed_at(),
            taken_at: self.clock.now(),
        };
        self.store.save(snapshot.clone()).await?;
        debug!(aggregate = %root.id(), version = snapshot.version, "Snapshot taken");
        Ok(snapshot)
    }

    /// Restores `id` from its snapshot.
    ///
    /// Returns `None` when there is no usable snapshot: none stored, another
    /// schema version, or undecodable state.
    ///
    /// # Errors
    ///
    /// Returns an error only if the storage is unavailable.
    pub async fn restore<A: Aggregate>(
        &self,
        id: &AggregateId,
    ) -> Result<Option<AggregateRoot<A>>, DomainError> {
        let Some(snapshot) = self.store.load(id).await? else {
            return Ok(None);
        };
        if snapshot.schema_version != A::SNAPSHOT_SCHEMA {
            warn!(
                aggregate = %id,
                stored = snapshot.schema_version,
                current = A::SNAPSHOT_SCHEMA,
                "Snapshot schema changed; treating as cache miss"
            );
            return Ok(None);
        }
        match serde_json::from_value::<A>(snapshot.state) {
            Ok(state) => Ok(Some(AggregateRoot::from_snapshot(
                id.clone(),
                state,
                snapshot.version,
                snapshot.created_at,
                snapshot.closed_at,
            )?)),
            Err(e) => {
                warn!(
                    aggregate = %id,
                    error = %e,
                    "Failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use servicebus_test_support::FixedClock;

    use super::*;
    use crate::test_fixtures::{Account, account_id, deposited};

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()))
    }

    #[test]
    fn test_trigger_fires_without_prior_snapshot() {
        let trigger = VersionIncreaseTrigger::new(10);

        assert!(trigger.snapshot_must_be_created(0, None));
        assert!(trigger.snapshot_must_be_created(3, None));
    }

    #[test]
    fn test_trigger_waits_for_step_interval() {
        let trigger = VersionIncreaseTrigger::new(10);

        assert!(!trigger.snapshot_must_be_created(20, Some(12)));
        assert!(trigger.snapshot_must_be_created(22, Some(12)));
    }

    proptest! {
        #[test]
        fn prop_trigger_matches_version_distance(previous in 0u64..1_000, delta in 0u64..100, step in 1u64..50) {
            let trigger = VersionIncreaseTrigger::new(step);

            let due = trigger.snapshot_must_be_created(previous + delta, Some(previous));

            prop_assert_eq!(due, delta >= step);
        }
    }

    #[tokio::test]
    async fn test_take_then_restore_rebuilds_state() {
        // Arrange
        let clock = clock();
        let store = Arc::new(InMemorySnapshotStore::new());
        let snapshotter = Snapshotter::new(
            store.clone(),
            Arc::new(VersionIncreaseTrigger::default()),
            clock.clone(),
        );
        let mut root = AggregateRoot::<Account>::create(account_id("a-1"), clock.as_ref()).unwrap();
        root.raise(deposited("a-1", 40), clock.as_ref()).unwrap();

        // Act
        snapshotter.take(&root).await.unwrap();
        let restored = snapshotter
            .restore::<Account>(&account_id("a-1"))
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!(restored.state(), root.state());
        assert_eq!(restored.version(), 1);
        assert_eq!(restored.last_snapshot_version(), Some(1));
        assert_eq!(store.stored_count().await, 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_a_cache_miss() {
        let clock = clock();
        let store = Arc::new(InMemorySnapshotStore::new());
        store
            .save(Snapshot {
                aggregate_id: account_id("a-1"),
                version: 4,
                schema_version: 99,
                state: serde_json::json!({ "balance": 1, "operations": 1 }),
                created_at: clock.0,
                closed_at: None,
                taken_at: clock.0,
            })
            .await
            .unwrap();
        let snapshotter = Snapshotter::new(store, Arc::new(VersionIncreaseTrigger::default()), clock);

        let restored = snapshotter.restore::<Account>(&account_id("a-1")).await.unwrap();

        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_state_is_a_cache_miss() {
        let clock = clock();
        let store = Arc::new(InMemorySnapshotStore::new());
        store
            .save(Snapshot {
                aggregate_id: account_id("a-1"),
                version: 4,
                schema_version: 1,
                state: serde_json::json!({ "balance": "lots" }),
                created_at: clock.0,
                closed_at: None,
                taken_at: clock.0,
            })
            .await
            .unwrap();
        let snapshotter = Snapshotter::new(store, Arc::new(VersionIncreaseTrigger::default()), clock);

        let restored = snapshotter.restore::<Account>(&account_id("a-1")).await.unwrap();

        assert!(restored.is_none());
    }
}
