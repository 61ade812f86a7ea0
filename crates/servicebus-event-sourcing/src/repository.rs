//! Event-sourced repository: load, append, snapshot, publish.
//!
//! Saving follows a fixed order. Pending events are appended first. A
//! snapshot is then taken if the trigger asks for one (a failed snapshot is
//! logged, never fatal). Only after the append succeeded are the events
//! published through the delivery context, so nothing is announced that was
//! not persisted.

use std::marker::PhantomData;
use std::sync::Arc;

use servicebus_core::context::{DeliveryContext, DeliveryOptions};
use servicebus_core::error::DomainError;
use servicebus_core::identity::{AggregateId, Identity};
use tracing::{debug, warn};

use crate::aggregate::{Aggregate, AggregateRoot, replay};
use crate::snapshot::Snapshotter;
use crate::store::{EventStreamStore, StoredEvent};

/// Loads and saves aggregates of type `A`.
pub struct EventSourcedRepository<A> {
    store: Arc<dyn EventStreamStore>,
    snapshotter: Option<Arc<Snapshotter>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for EventSourcedRepository<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            snapshotter: self.snapshotter.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> EventSourcedRepository<A> {
    /// Creates a repository without snapshots.
    #[must_use]
    pub fn new(store: Arc<dyn EventStreamStore>) -> Self {
        Self {
            store,
            snapshotter: None,
            _aggregate: PhantomData,
        }
    }

    /// Enables snapshots.
    #[must_use]
    pub fn with_snapshotter(mut self, snapshotter: Arc<Snapshotter>) -> Self {
        self.snapshotter = Some(snapshotter);
        self
    }

    /// Loads `id`, from its snapshot plus tail when one is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stream cannot be replayed.
    pub async fn load(&self, id: &AggregateId) -> Result<Option<AggregateRoot<A>>, DomainError> {
        if let Some(snapshotter) = &self.snapshotter {
            if let Some(mut root) = snapshotter.restore::<A>(id).await? {
                let tail = self
                    .store
                    .load_from_playhead(id, root.version() + 1)
                    .await?;
                match tail {
                    Some(stream) if stream.version >= root.version() => {
                        replay(&mut root, &stream.events)?;
                        debug!(
                            aggregate = %id,
                            snapshot_version = root.last_snapshot_version(),
                            version = root.version(),
                            "Aggregate restored from snapshot"
                        );
                        return Ok(Some(root));
                    }
                    _ => {
                        warn!(
                            aggregate = %id,
                            "Snapshot is ahead of its event stream; replaying from the start"
                        );
                    }
                }
            }
        }

        let Some(stream) = self.store.load(id).await? else {
            return Ok(None);
        };
        let mut root = AggregateRoot::restore(id.clone(), &stream.events)?;
        root.forget_snapshot();
        Ok(Some(root))
    }

    /// Loads `id`, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` when there is no stream.
    pub async fn load_existing(&self, id: &AggregateId) -> Result<AggregateRoot<A>, DomainError> {
        self.load(id)
            .await?
            .ok_or_else(|| DomainError::AggregateNotFound(id.composite_key()))
    }

    /// Appends pending events, snapshots if due, then publishes the events.
    ///
    /// Returns the stored events; nothing happens when there is nothing
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns the append error (the root keeps its pending events), or the
    /// first publication error after a successful append.
    pub async fn save(
        &self,
        root: &mut AggregateRoot<A>,
        context: &dyn DeliveryContext,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        if root.uncommitted().is_empty() {
            return Ok(Vec::new());
        }
        let new_events = root
            .uncommitted()
            .iter()
            .map(|event| event.to_new_event())
            .collect::<Result<Vec<_>, _>>()?;

        let stored = self
            .store
            .append(root.id(), root.expected_version(), new_events)
            .await?;
        let committed = root.mark_committed();
        debug!(
            aggregate = %root.id(),
            appended = stored.len(),
            version = root.version(),
            "Events appended"
        );

        if let Some(snapshotter) = &self.snapshotter {
            if snapshotter.is_due(root) {
                match snapshotter.take(root).await {
                    Ok(_) => root.mark_snapshotted(),
                    Err(e) => {
                        warn!(aggregate = %root.id(), error = %e, "Snapshot failed");
                    }
                }
            }
        }

        for event in &committed {
            context
                .publish(event.change.to_message(), DeliveryOptions::default())
                .await?;
        }
        Ok(stored)
    }
}
