//! Saga definitions: the static routing map of one saga type.
//!
//! Every saga type declares, once and explicitly, the message that starts it,
//! the messages that advance it and where its identity comes from. The
//! engine validates definitions at startup, so a routing decision is never
//! made by inspecting types at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use servicebus_core::error::{ConfigurationError, DomainError};
use servicebus_core::message::{Message, MessageContract, MessageKind, downcast};
use servicebus_core::serializer::MessageTypeRegistry;
use servicebus_core::time::RelativeOffset;

use crate::identity::{SagaId, SagaStatus};

/// Default lifetime of a saga instance.
pub const DEFAULT_EXPIRATION_SECONDS: i64 = 3_600;

/// Reason recorded when a saga fails because it outlived its expiration.
pub const EXPIRED_REASON: &str = "expired";

/// A saga type: its persisted state plus its definition.
///
/// The state is serialized as explicit serde fields tagged with
/// [`SCHEMA_VERSION`](Saga::SCHEMA_VERSION).
pub trait Saga: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Namespace of this saga type.
    const SAGA_TYPE: &'static str;

    /// Layout version of the serialized state.
    const SCHEMA_VERSION: u32 = 1;

    /// Builds the routing map of this saga type.
    fn definition() -> SagaDefinition<Self>;
}

type StartFn<S> = Box<dyn Fn(&dyn Message, &mut SagaContext) -> Result<S, DomainError> + Send + Sync>;
type EventFn<S> =
    Box<dyn Fn(&mut S, &dyn Message, &mut SagaContext) -> Result<(), DomainError> + Send + Sync>;

/// Reads a saga identifier from a message.
pub type IdentifierExtractor = Box<dyn Fn(&dyn Message) -> Option<String> + Send + Sync>;

type Registrar = fn(&mut MessageTypeRegistry);

struct StartRoute<S> {
    message_type: &'static str,
    kind: MessageKind,
    handler: StartFn<S>,
}

struct EventRoute<S> {
    kind: MessageKind,
    handler: EventFn<S>,
}

/// One message type a saga reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    /// Namespace of the message.
    pub message_type: &'static str,
    /// Declared kind of the message.
    pub kind: MessageKind,
    /// The message starts a saga.
    pub starts: bool,
    /// The message advances an existing saga.
    pub advances: bool,
}

/// Routing map of saga type `S`, assembled with a builder.
pub struct SagaDefinition<S> {
    identifier_property: String,
    expire_after: RelativeOffset,
    start: Option<StartRoute<S>>,
    routes: HashMap<&'static str, EventRoute<S>>,
    extractors: HashMap<&'static str, IdentifierExtractor>,
    registrars: Vec<Registrar>,
    problems: Vec<String>,
}

impl<S: Saga> SagaDefinition<S> {
    /// Starts a definition whose identity is read from `identifier_property`.
    #[must_use]
    pub fn new(identifier_property: impl Into<String>) -> Self {
        Self {
            identifier_property: identifier_property.into(),
            expire_after: RelativeOffset::from_seconds(DEFAULT_EXPIRATION_SECONDS),
            start: None,
            routes: HashMap::new(),
            extractors: HashMap::new(),
            registrars: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Lifetime of each instance, counted from its start.
    #[must_use]
    pub fn expire_after(mut self, offset: RelativeOffset) -> Self {
        self.expire_after = offset;
        self
    }

    /// Declares the message that creates an instance.
    ///
    /// The trigger is usually a command; an event works too and lets the saga
    /// start from something another service published.
    #[must_use]
    pub fn started_by<M, F>(mut self, f: F) -> Self
    where
        M: MessageContract,
        F: Fn(&M, &mut SagaContext) -> Result<S, DomainError> + Send + Sync + 'static,
    {
        if let Some(previous) = &self.start {
            self.problems.push(format!(
                "start trigger declared twice ({} and {})",
                previous.message_type,
                M::MESSAGE_TYPE
            ));
        }
        self.start = Some(StartRoute {
            message_type: M::MESSAGE_TYPE,
            kind: M::KIND,
            handler: Box::new(move |message, ctx| f(expect_type::<M>(message)?, ctx)),
        });
        self.registrars.push(register_type::<M>);
        self
    }

    /// Declares a handler advancing an instance on message `M`.
    #[must_use]
    pub fn on<M, F>(mut self, f: F) -> Self
    where
        M: MessageContract,
        F: Fn(&mut S, &M, &mut SagaContext) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        let route = EventRoute {
            kind: M::KIND,
            handler: Box::new(move |state, message, ctx| f(state, expect_type::<M>(message)?, ctx)),
        };
        if self.routes.insert(M::MESSAGE_TYPE, route).is_some() {
            self.problems
                .push(format!("{} is handled more than once", M::MESSAGE_TYPE));
        }
        self.registrars.push(register_type::<M>);
        self
    }

    /// Reads the identifier of messages of type `M` with `f` instead of the
    /// declared identifier property.
    #[must_use]
    pub fn identify<M, F>(mut self, f: F) -> Self
    where
        M: MessageContract,
        F: Fn(&M) -> String + Send + Sync + 'static,
    {
        let extractor: IdentifierExtractor = Box::new(move |message| downcast::<M>(message).map(&f));
        if self.extractors.insert(M::MESSAGE_TYPE, extractor).is_some() {
            self.problems
                .push(format!("identifier extractor for {} declared twice", M::MESSAGE_TYPE));
        }
        self
    }

    /// The declared identifier property.
    #[must_use]
    pub fn identifier_property(&self) -> &str {
        &self.identifier_property
    }

    /// Lifetime of each instance.
    #[must_use]
    pub fn expiration(&self) -> RelativeOffset {
        self.expire_after
    }

    /// Every message type this saga reacts to, sorted by namespace.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .routes
            .iter()
            .map(|(message_type, route)| Subscription {
                message_type: *message_type,
                kind: route.kind,
                starts: false,
                advances: true,
            })
            .collect();
        if let Some(start) = &self.start {
            match subscriptions
                .iter_mut()
                .find(|s| s.message_type == start.message_type)
            {
                Some(existing) => existing.starts = true,
                None => subscriptions.push(Subscription {
                    message_type: start.message_type,
                    kind: start.kind,
                    starts: true,
                    advances: false,
                }),
            }
        }
        subscriptions.sort_by_key(|s| s.message_type);
        subscriptions
    }

    /// Checks the definition for wiring mistakes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSagaDefinition` on an empty
    /// identifier property, a missing start trigger, a non-positive
    /// expiration, duplicate routes, or an extractor for an unhandled message.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidSagaDefinition {
            saga: S::SAGA_TYPE.to_owned(),
            reason,
        };
        if self.identifier_property.trim().is_empty() {
            return Err(invalid("identifier property must not be empty".to_owned()));
        }
        if self.start.is_none() {
            return Err(invalid("no start trigger declared".to_owned()));
        }
        if !self.expire_after.is_positive() {
            return Err(invalid(format!(
                "expiration offset must be positive, got {}",
                self.expire_after
            )));
        }
        if let Some(problem) = self.problems.first() {
            return Err(invalid(problem.clone()));
        }
        let subscriptions = self.subscriptions();
        if let Some(orphan) = self
            .extractors
            .keys()
            .find(|ns| !subscriptions.iter().any(|s| s.message_type == **ns))
        {
            return Err(invalid(format!(
                "identifier extractor declared for {orphan}, which the saga does not handle"
            )));
        }
        Ok(())
    }

    /// Resolves the identity of the instance `message` belongs to.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidSagaIdentifier` when no identifier can be
    /// read from the message.
    pub fn resolve(&self, message: &dyn Message) -> Result<SagaId, DomainError> {
        resolve_identifier(
            S::SAGA_TYPE,
            &self.identifier_property,
            self.extractors.get(message.message_type()),
            message,
        )
    }

    /// Runs the start handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or `DomainError::Handler` if `message` is
    /// not the start trigger.
    pub fn start(&self, message: &dyn Message, ctx: &mut SagaContext) -> Result<S, DomainError> {
        let start = self
            .start
            .as_ref()
            .filter(|start| start.message_type == message.message_type())
            .ok_or_else(|| {
                DomainError::Handler(format!(
                    "{} cannot start saga {}",
                    message.message_type(),
                    S::SAGA_TYPE
                ))
            })?;
        (start.handler)(message, ctx)
    }

    /// Runs the handler registered for `message` against `state`.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or `DomainError::Handler` if the saga has
    /// no handler for the message.
    pub fn advance(
        &self,
        state: &mut S,
        message: &dyn Message,
        ctx: &mut SagaContext,
    ) -> Result<(), DomainError> {
        let route = self.routes.get(message.message_type()).ok_or_else(|| {
            DomainError::Handler(format!(
                "saga {} does not handle {}",
                S::SAGA_TYPE,
                message.message_type()
            ))
        })?;
        (route.handler)(state, message, ctx)
    }

    /// Registers every message type the saga handles for decoding.
    pub fn register_types(&self, registry: &mut MessageTypeRegistry) {
        for register in &self.registrars {
            register(registry);
        }
    }
}

impl<S> fmt::Debug for SagaDefinition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self.routes.keys().copied().collect();
        routes.sort_unstable();
        f.debug_struct("SagaDefinition")
            .field("identifier_property", &self.identifier_property)
            .field("expire_after", &self.expire_after)
            .field("start", &self.start.as_ref().map(|s| s.message_type))
            .field("routes", &routes)
            .finish_non_exhaustive()
    }
}

fn register_type<M: MessageContract>(registry: &mut MessageTypeRegistry) {
    registry.register::<M>();
}

fn expect_type<M: MessageContract>(message: &dyn Message) -> Result<&M, DomainError> {
    downcast::<M>(message).ok_or_else(|| {
        DomainError::Handler(format!(
            "expected {} but received {}",
            M::MESSAGE_TYPE,
            message.message_type()
        ))
    })
}

/// Reads the identity of saga type `saga_type` from `message`.
///
/// The explicit `extractor` wins; otherwise `property` is read from the
/// message's normalized fields. Strings and numbers are accepted.
///
/// # Errors
///
/// Returns `DomainError::InvalidSagaIdentifier` when the property name is
/// empty, the message has no such property, or the value is empty.
pub fn resolve_identifier(
    saga_type: &str,
    property: &str,
    extractor: Option<&IdentifierExtractor>,
    message: &dyn Message,
) -> Result<SagaId, DomainError> {
    let message_type = message.message_type();
    if property.trim().is_empty() {
        return Err(DomainError::InvalidSagaIdentifier(format!(
            "saga {saga_type} declares no identifier property"
        )));
    }
    let no_accessor = || {
        DomainError::InvalidSagaIdentifier(format!(
            "{message_type} has no accessor for {property} (saga {saga_type})"
        ))
    };
    let value = match extractor {
        Some(extract) => extract(message).ok_or_else(no_accessor)?,
        None => match message.to_payload()?.get(property) {
            None => return Err(no_accessor()),
            Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(value)) => value.clone(),
            Some(serde_json::Value::Number(value)) => value.to_string(),
            Some(_) => {
                return Err(DomainError::InvalidSagaIdentifier(format!(
                    "{property} of {message_type} is not a string or number"
                )));
            }
        },
    };
    if value.trim().is_empty() {
        return Err(DomainError::InvalidSagaIdentifier(format!(
            "{property} of {message_type} is empty (saga {saga_type})"
        )));
    }
    SagaId::new(saga_type, value)
}

/// Status change requested by a saga handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Target status.
    pub status: SagaStatus,
    /// Why.
    pub reason: Option<String>,
}

/// What a saga handler can do besides mutating its state: send messages
/// and close the saga.
#[derive(Debug)]
pub struct SagaContext {
    saga_id: SagaId,
    now: DateTime<Utc>,
    outbound: Vec<Arc<dyn Message>>,
    transition: Option<Transition>,
}

impl SagaContext {
    /// Creates a context for one handler call.
    #[must_use]
    pub fn new(saga_id: SagaId, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            now,
            outbound: Vec::new(),
            transition: None,
        }
    }

    /// Identity of the saga being handled.
    #[must_use]
    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    /// Time of the current pass.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Queues a command or event; it is published once the pass commits.
    pub fn fire<M: MessageContract>(&mut self, message: M) {
        self.outbound.push(Arc::new(message));
    }

    /// Marks the saga as completed.
    pub fn complete(&mut self) {
        self.transition = Some(Transition {
            status: SagaStatus::Completed,
            reason: None,
        });
    }

    /// Marks the saga as failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.transition = Some(Transition {
            status: SagaStatus::Failed,
            reason: Some(reason.into()),
        });
    }

    /// Messages queued so far and the requested transition (the last call
    /// to `complete` or `fail` wins).
    #[must_use]
    pub fn into_parts(self) -> (Vec<Arc<dyn Message>>, Option<Transition>) {
        (self.outbound, self.transition)
    }
}
