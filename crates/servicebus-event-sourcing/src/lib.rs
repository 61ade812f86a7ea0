//! Event sourcing for the service bus kernel.
//!
//! Aggregates are rebuilt from append-only event streams. Every stream starts
//! with an [`AggregateCreated`](aggregate::AggregateCreated) event at playhead
//! 0, and playheads are contiguous from there. Snapshots shortcut the replay
//! and are governed by a pluggable [`SnapshotTrigger`](snapshot::SnapshotTrigger).

pub mod aggregate;
pub mod repository;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub(crate) mod test_fixtures;
