//! Saga orchestration for the service bus kernel.
//!
//! A saga is a persistent state machine driven by messages. Each saga type
//! declares, through a [`SagaDefinition`](definition::SagaDefinition), which
//! message starts it, which events advance it and which property carries its
//! identity. The [`SagaEngine`](engine::SagaEngine) validates these
//! definitions once at startup and routes messages at runtime; every saga
//! touched while handling one message is written back in a single commit.
//!
//! The [`scheduler`] module reuses the same store-and-guard pattern for
//! commands that must be emitted at a later date.

pub mod definition;
pub mod engine;
pub mod events;
pub mod identity;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod test_fixtures;
