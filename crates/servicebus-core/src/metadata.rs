//! Metadata envelope attached to a message in transit.
//!
//! Keys starting with [`RESERVED_PREFIX`] are system-owned. Application code
//! adds its own headers through [`Metadata::with_header`], which refuses the
//! reserved namespace. An envelope is never mutated in place: every change
//! returns a new envelope, so a retry always observes a fresh copy with an
//! incremented retry counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Prefix of system-owned keys.
pub const RESERVED_PREFIX: &str = "x-bus-";

/// Trace/correlation identifier of the operation.
pub const TRACE_ID: &str = "x-bus-trace-id";

/// Serializer that produced the payload.
pub const SERIALIZER: &str = "x-bus-serializer";

/// Namespace of the carried message.
pub const MESSAGE_TYPE: &str = "x-bus-message-type";

/// Number of retries already performed for this delivery.
pub const RETRY_COUNT: &str = "x-bus-retry-count";

/// Handler that failed processing this delivery.
pub const FAILURE_ORIGIN: &str = "x-bus-failure-origin";

/// Key/value envelope carried beside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    /// Creates an envelope for a new operation.
    #[must_use]
    pub fn new(trace_id: Uuid) -> Self {
        Self::default().with_reserved(TRACE_ID, trace_id.to_string())
    }

    /// Creates an envelope with a freshly generated trace id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Rebuilds an envelope received from a transport, reserved keys included.
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Returns `true` if `key` belongs to the system-owned namespace.
    #[must_use]
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with(RESERVED_PREFIX)
    }

    /// Returns a copy with an application header added.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ReservedMetadataKey` if `key` is system-owned.
    pub fn with_header(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let key = key.into();
        if Self::is_reserved(&key) {
            return Err(DomainError::ReservedMetadataKey(key));
        }
        let mut entries = self.entries.clone();
        entries.insert(key, value.into());
        Ok(Self { entries })
    }

    /// Returns a copy with a system-owned key set.
    ///
    /// Intended for kernel components (serializers, dispatcher, transports).
    #[must_use]
    pub fn with_reserved(&self, key: &str, value: impl Into<String>) -> Self {
        debug_assert!(Self::is_reserved(key), "{key} is not a reserved key");
        let mut entries = self.entries.clone();
        entries.insert(key.to_owned(), value.into());
        Self { entries }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Consumes the envelope, returning its raw entries.
    #[must_use]
    pub fn into_entries(self) -> BTreeMap<String, String> {
        self.entries
    }

    /// Trace id, if present and well-formed.
    #[must_use]
    pub fn trace_id(&self) -> Option<Uuid> {
        self.get(TRACE_ID).and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Serializer kind, if recorded.
    #[must_use]
    pub fn serializer(&self) -> Option<&str> {
        self.get(SERIALIZER)
    }

    /// Message namespace, if recorded.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.get(MESSAGE_TYPE)
    }

    /// Retries already performed (zero when absent or malformed).
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.get(RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Handler that failed this delivery, if any.
    #[must_use]
    pub fn failure_origin(&self) -> Option<&str> {
        self.get(FAILURE_ORIGIN)
    }

    /// Returns a copy whose retry counter is one higher.
    #[must_use]
    pub fn next_retry(&self) -> Self {
        self.with_retry_count(self.retry_count().saturating_add(1))
    }

    /// Returns a copy with the retry counter set to `count`.
    #[must_use]
    pub fn with_retry_count(&self, count: u32) -> Self {
        self.with_reserved(RETRY_COUNT, count.to_string())
    }

    /// Returns a copy tagged with the handler that failed.
    #[must_use]
    pub fn with_failure_origin(&self, origin: &str) -> Self {
        self.with_reserved(FAILURE_ORIGIN, origin)
    }

    /// Envelope for a message produced while handling this one: same trace
    /// id, no retry or failure bookkeeping.
    #[must_use]
    pub fn derive_outbound(&self) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(trace) = self.get(TRACE_ID) {
            entries.insert(TRACE_ID.to_owned(), trace.to_owned());
        }
        Self { entries }
    }
}
