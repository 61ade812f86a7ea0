//! Saga identity and status.

use std::fmt;

use serde::{Deserialize, Serialize};
use servicebus_core::error::DomainError;
use servicebus_core::identity::Identity;

/// Identity of one saga instance: saga type plus a key taken from a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawSagaId")]
pub struct SagaId {
    saga_type: String,
    value: String,
}

#[derive(Deserialize)]
struct RawSagaId {
    saga_type: String,
    value: String,
}

impl TryFrom<RawSagaId> for SagaId {
    type Error = DomainError;

    fn try_from(raw: RawSagaId) -> Result<Self, Self::Error> {
        Self::new(raw.saga_type, raw.value)
    }
}

impl SagaId {
    /// Creates a saga identity.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidSagaIdentifier` if either part is empty.
    pub fn new(saga_type: impl Into<String>, value: impl Into<String>) -> Result<Self, DomainError> {
        let saga_type = saga_type.into();
        let value = value.into();
        if saga_type.trim().is_empty() {
            return Err(DomainError::InvalidSagaIdentifier(
                "saga type must not be empty".to_owned(),
            ));
        }
        if value.trim().is_empty() {
            return Err(DomainError::InvalidSagaIdentifier(format!(
                "identifier of saga {saga_type} must not be empty"
            )));
        }
        Ok(Self { saga_type, value })
    }

    /// The saga type.
    #[must_use]
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }
}

impl Identity for SagaId {
    fn namespace(&self) -> &str {
        &self.saga_type
    }

    fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite_key())
    }
}

/// Saga lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Still accepting events.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (explicitly or by expiring).
    Failed,
}

impl SagaStatus {
    /// Whether the status rejects further events.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_id_composite_key() {
        let id = SagaId::new("order_fulfillment", "o-1").unwrap();

        assert_eq!(id.composite_key(), "order_fulfillment:o-1");
    }

    #[test]
    fn test_empty_saga_identifier_is_rejected() {
        let err = SagaId::new("order_fulfillment", " ").unwrap_err();

        assert!(matches!(err, DomainError::InvalidSagaIdentifier(_)));
    }

    #[test]
    fn test_deserialize_rejects_blank_identifier() {
        let stored = r#"{"saga_type":"order_fulfillment","value":""}"#;

        let err = serde_json::from_str::<SagaId>(stored).unwrap_err();

        assert!(err.to_string().contains("invalid saga identifier"));
    }

    #[test]
    fn test_only_in_progress_is_open() {
        assert!(!SagaStatus::InProgress.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }
}
