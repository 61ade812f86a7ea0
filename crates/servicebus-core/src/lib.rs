//! Service bus core: shared message, delivery and failure abstractions.
//!
//! This crate defines the contracts every other crate in the workspace
//! depends on: messages and their metadata envelope, identities, the
//! per-dispatch delivery context, handler and validation seams, the retry
//! executor and the message serializer. It contains no storage or transport
//! code.

pub mod context;
pub mod error;
pub mod handler;
pub mod identity;
pub mod message;
pub mod metadata;
pub mod retry;
pub mod serializer;
pub mod time;
pub mod validation;
