//! Identity capability shared by aggregates, sagas and scheduled operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A typed identity: a namespace plus an opaque string value.
pub trait Identity: Send + Sync {
    /// Namespace of the identity (aggregate type, saga type, ...).
    fn namespace(&self) -> &str;

    /// The identity value.
    fn as_str(&self) -> &str;

    /// Storage key in the form `namespace:value`.
    fn composite_key(&self) -> String {
        format!("{}:{}", self.namespace(), self.as_str())
    }
}

/// Identity of one aggregate instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawAggregateId")]
pub struct AggregateId {
    aggregate_type: String,
    value: String,
}

#[derive(Deserialize)]
struct RawAggregateId {
    aggregate_type: String,
    value: String,
}

impl TryFrom<RawAggregateId> for AggregateId {
    type Error = DomainError;

    fn try_from(raw: RawAggregateId) -> Result<Self, Self::Error> {
        Self::new(raw.aggregate_type, raw.value)
    }
}

impl AggregateId {
    /// Creates an aggregate identity.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if either part is empty.
    pub fn new(
        aggregate_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let aggregate_type = aggregate_type.into();
        let value = value.into();
        if aggregate_type.trim().is_empty() {
            return Err(DomainError::Validation(
                "aggregate type must not be empty".to_owned(),
            ));
        }
        if value.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "{aggregate_type} identity must not be empty"
            )));
        }
        Ok(Self {
            aggregate_type,
            value,
        })
    }

    /// The aggregate type this identity belongs to.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }
}

impl Identity for AggregateId {
    fn namespace(&self) -> &str {
        &self.aggregate_type
    }

    fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite_key())
    }
}
