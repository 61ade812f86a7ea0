//! Message abstractions.
//!
//! A message is either a command (exactly one owner) or an event (any number
//! of listeners). Its identity is the namespace returned by
//! [`Message::message_type`]. Messages never carry transport metadata; that
//! travels beside them in a [`Metadata`](crate::metadata::Metadata) envelope.

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Routing role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Routed to exactly one handler.
    Command,
    /// Routed to zero or more listeners.
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// Object-safe view of a message, used wherever messages are routed
/// without knowing their concrete type.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// The namespace identifying this message type (for routing/decoding).
    fn message_type(&self) -> &'static str;

    /// Whether this message is a command or an event.
    fn kind(&self) -> MessageKind;

    /// Normalizes the message into transport-neutral structured fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the fields cannot be
    /// represented as JSON.
    fn to_payload(&self) -> Result<serde_json::Value, DomainError>;

    /// Upcast used for downcasting to the concrete message type.
    fn as_any(&self) -> &dyn Any;
}

/// Trait that all concrete commands and events implement.
///
/// Implementing this gives the type a [`Message`] implementation for free.
pub trait MessageContract:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Stable namespace (e.g. `"orders.place_order"`).
    const MESSAGE_TYPE: &'static str;

    /// Routing role.
    const KIND: MessageKind;
}

impl<T: MessageContract> Message for T {
    fn message_type(&self) -> &'static str {
        T::MESSAGE_TYPE
    }

    fn kind(&self) -> MessageKind {
        T::KIND
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        serde_json::to_value(self).map_err(|e| {
            DomainError::Serialization(format!("normalizing {} failed: {e}", T::MESSAGE_TYPE))
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Returns the concrete message if `message` is an `M`.
#[must_use]
pub fn downcast<M: MessageContract>(message: &dyn Message) -> Option<&M> {
    message.as_any().downcast_ref::<M>()
}

/// Rebuilds a message from its normalized fields.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if the fields do not match `M`.
pub fn denormalize<M: MessageContract>(payload: serde_json::Value) -> Result<M, DomainError> {
    serde_json::from_value(payload).map_err(|e| {
        DomainError::Serialization(format!("denormalizing {} failed: {e}", M::MESSAGE_TYPE))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RegisterUser {
        user_id: String,
        email: String,
    }

    impl MessageContract for RegisterUser {
        const MESSAGE_TYPE: &'static str = "users.register_user";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct UserRegistered {
        user_id: String,
    }

    impl MessageContract for UserRegistered {
        const MESSAGE_TYPE: &'static str = "users.user_registered";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[test]
    fn test_contract_provides_object_safe_message() {
        // Arrange
        let command = RegisterUser {
            user_id: "u-1".to_owned(),
            email: "ada@example.com".to_owned(),
        };
        let message: &dyn Message = &command;

        // Act
        let payload = message.to_payload().unwrap();

        // Assert
        assert_eq!(message.message_type(), "users.register_user");
        assert_eq!(message.kind(), MessageKind::Command);
        assert_eq!(payload["email"], "ada@example.com");
    }

    #[test]
    fn test_downcast_matches_only_the_concrete_type() {
        let event = UserRegistered {
            user_id: "u-1".to_owned(),
        };
        let message: &dyn Message = &event;

        assert!(downcast::<UserRegistered>(message).is_some());
        assert!(downcast::<RegisterUser>(message).is_none());
    }

    #[test]
    fn test_denormalize_reports_namespace_on_mismatch() {
        let err = denormalize::<RegisterUser>(serde_json::json!({ "user_id": 5 })).unwrap_err();

        assert!(err.to_string().contains("users.register_user"));
    }

    #[test]
    fn test_denormalize_restores_fields() {
        let command = RegisterUser {
            user_id: "u-9".to_owned(),
            email: "x@example.com".to_owned(),
        };

        let restored = denormalize::<RegisterUser>(command.to_payload().unwrap()).unwrap();

        assert_eq!(restored, command);
    }
}
