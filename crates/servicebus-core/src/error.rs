//! Error taxonomy shared by the dispatcher, event sourcing and saga engines.

use thiserror::Error;

/// Coarse classification of a [`DomainError`].
///
/// Retry policies declare which kinds are eligible for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wiring mistakes: missing or ambiguous handlers, bad definitions.
    Configuration,
    /// A message or operation violated declared constraints.
    Validation,
    /// Optimistic concurrency conflict on a stream or saga.
    Concurrency,
    /// Closed streams/sagas, duplicates, missing instances, bad identifiers.
    Lifecycle,
    /// Payload could not be normalized or denormalized.
    Serialization,
    /// Storage or transport unavailability.
    Infrastructure,
    /// A handler reported a failure of its own.
    Handler,
    /// Handler execution exceeded its configured timeout.
    Timeout,
}

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A stream was created for an identity that already has one.
    #[error("event stream {0} already exists")]
    NonUniqueStreamId(String),

    /// Events were raised on, or appended to, a closed stream.
    #[error("event stream {0} is closed")]
    ClosedStream(String),

    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Optimistic concurrency conflict.
    #[error(
        "concurrent modification of {id}: expected version {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        /// Composite key of the conflicting stream or saga.
        id: String,
        /// The version the writer expected.
        expected: Option<u64>,
        /// The version found in storage.
        actual: Option<u64>,
    },

    /// A saga with the same identity already exists.
    #[error("saga {0} already exists")]
    DuplicateSaga(String),

    /// No saga exists for the resolved identity.
    #[error("saga {0} not found")]
    SagaNotFound(String),

    /// The saga reached a terminal status and rejects further events.
    #[error("saga {0} is closed")]
    ClosedSaga(String),

    /// The saga identifier could not be resolved from a message.
    #[error("invalid saga identifier: {0}")]
    InvalidSagaIdentifier(String),

    /// A scheduled operation with the same identifier already exists.
    #[error("scheduled operation {0} already exists")]
    DuplicateScheduledOperation(String),

    /// No scheduled operation exists for the identifier.
    #[error("scheduled operation {0} not found")]
    ScheduledOperationNotFound(String),

    /// Application code tried to write a system-owned metadata key.
    #[error("metadata key {0} is reserved")]
    ReservedMetadataKey(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A payload could not be normalized or denormalized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Handler execution exceeded its timeout.
    #[error("handler {handler} timed out after {timeout_ms} ms")]
    Timeout {
        /// Name of the handler that was abandoned.
        handler: String,
        /// The configured timeout.
        timeout_ms: u128,
    },

    /// A handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A wiring problem surfaced at runtime.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Any other failure, with its original cause preserved.
    #[error("{context}: {source}")]
    Wrapped {
        /// What was being attempted.
        context: String,
        /// The original error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DomainError {
    /// Wraps an arbitrary error, keeping it as the source.
    pub fn wrap(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) | Self::ReservedMetadataKey(_) => ErrorKind::Validation,
            Self::ConcurrentModification { .. } => ErrorKind::Concurrency,
            Self::NonUniqueStreamId(_)
            | Self::ClosedStream(_)
            | Self::AggregateNotFound(_)
            | Self::DuplicateSaga(_)
            | Self::SagaNotFound(_)
            | Self::ClosedSaga(_)
            | Self::InvalidSagaIdentifier(_)
            | Self::DuplicateScheduledOperation(_)
            | Self::ScheduledOperationNotFound(_) => ErrorKind::Lifecycle,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Handler(_) | Self::Wrapped { .. } => ErrorKind::Handler,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors detected while wiring the kernel, before any message is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A command the service accepts has no handler.
    #[error("no handler registered for command {0}")]
    MissingCommandHandler(String),

    /// A command has more than one handler.
    #[error("command {message_type} has {count} handlers; exactly one is required")]
    AmbiguousCommandHandler {
        /// The command namespace.
        message_type: String,
        /// Number of handlers found.
        count: usize,
    },

    /// The same namespace was registered both as a command and as an event.
    #[error("message type {0} is registered both as a command and as an event")]
    ConflictingMessageKind(String),

    /// A handler was registered with a role that contradicts the message kind.
    #[error("handler {handler} registers {message_type} as {registered}, but it is declared as {declared}")]
    KindMismatch {
        /// Handler name.
        handler: String,
        /// The message namespace.
        message_type: String,
        /// Role the handler was registered under.
        registered: String,
        /// Kind declared by the message contract.
        declared: String,
    },

    /// Two saga definitions share a saga type.
    #[error("saga {0} is registered more than once")]
    DuplicateSaga(String),

    /// A saga definition is incomplete or inconsistent.
    #[error("saga {saga}: {reason}")]
    InvalidSagaDefinition {
        /// Saga type.
        saga: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A relative offset string could not be parsed or is out of range.
    #[error("invalid relative offset {0:?}")]
    InvalidRelativeOffset(String),

    /// Retry policy parameters are out of range.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// A handler is registered for a message type the serializer cannot decode.
    #[error("message type {0} is handled but not registered for decoding")]
    UndecodableMessageType(String),
}
