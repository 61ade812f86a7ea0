//! Message validation contracts.
//!
//! Validation is fail-soft: a message that violates its constraints is not
//! handled, and a [`MessageValidationFailed`] event is published for the
//! originating trace id instead. The inbound delivery is still acknowledged.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, MessageContract, MessageKind, downcast};

/// A single failed constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Property path that failed (empty for whole-message constraints).
    pub property: String,
    /// Human-readable description.
    pub message: String,
}

impl Violation {
    /// Creates a violation.
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

/// Constraints declared by a message type.
///
/// `groups` are the validation groups configured on the handler; an empty
/// slice means the default group.
pub trait Validate {
    /// Returns every violated constraint (empty when valid).
    fn validate(&self, groups: &[String]) -> Vec<Violation>;
}

/// Object-safe validator used by the dispatcher.
pub trait MessageValidator: Send + Sync {
    /// Validates `message` against the configured groups.
    fn validate(&self, message: &dyn Message, groups: &[String]) -> Vec<Violation>;
}

struct TypedValidator<M>(PhantomData<fn() -> M>);

impl<M> MessageValidator for TypedValidator<M>
where
    M: MessageContract + Validate,
{
    fn validate(&self, message: &dyn Message, groups: &[String]) -> Vec<Violation> {
        downcast::<M>(message)
            .map(|m| m.validate(groups))
            .unwrap_or_default()
    }
}

/// Validator for a message type implementing [`Validate`].
#[must_use]
pub fn validator_for<M>() -> std::sync::Arc<dyn MessageValidator>
where
    M: MessageContract + Validate,
{
    std::sync::Arc::new(TypedValidator::<M>(PhantomData))
}

/// Kernel event raised when an inbound message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageValidationFailed {
    /// Trace id of the rejected delivery.
    pub trace_id: Uuid,
    /// Namespace of the rejected message.
    pub message_type: String,
    /// Violation messages grouped by property.
    pub violations: BTreeMap<String, Vec<String>>,
}

impl MessageValidationFailed {
    /// Groups violations by property.
    #[must_use]
    pub fn new(trace_id: Uuid, message_type: &str, violations: &[Violation]) -> Self {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for violation in violations {
            grouped
                .entry(violation.property.clone())
                .or_default()
                .push(violation.message.clone());
        }
        Self {
            trace_id,
            message_type: message_type.to_owned(),
            violations: grouped,
        }
    }
}

impl MessageContract for MessageValidationFailed {
    const MESSAGE_TYPE: &'static str = "servicebus.message_validation_failed";
    const KIND: MessageKind = MessageKind::Event;
}
