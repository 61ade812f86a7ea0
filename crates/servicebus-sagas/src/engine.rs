//! The saga engine.
//!
//! Definitions are validated once when the engine is built. At runtime every
//! inbound message opens a [`SagaSession`] (one pass): the message is routed
//! to each subscribed saga type, the touched instances are kept in memory and
//! the whole pass is written back through [`SagaStore::commit`] before any
//! outbound message is published.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use servicebus_core::context::{DeliveryContext, publish_all};
use servicebus_core::error::{ConfigurationError, DomainError};
use servicebus_core::handler::{HandlerRegistration, MessageHandler};
use servicebus_core::identity::Identity;
use servicebus_core::message::{Message, MessageKind};
use servicebus_core::serializer::MessageTypeRegistry;
use servicebus_core::time::{Clock, RelativeOffset};
use tracing::{debug, info};

use crate::definition::{EXPIRED_REASON, Saga, SagaContext, SagaDefinition, Subscription};
use crate::events::{SagaClosed, SagaCreated, SagaStatusChanged, register_lifecycle_events};
use crate::identity::{SagaId, SagaStatus};
use crate::store::{SagaChange, SagaStore, StoredSaga};

/// Name under which the engine registers with the dispatcher.
pub const HANDLER_NAME: &str = "saga-engine";

/// Type-erased view of one saga type.
trait SagaRunner: Send + Sync {
    fn saga_type(&self) -> &'static str;
    fn schema_version(&self) -> u32;
    fn expiration(&self) -> RelativeOffset;
    fn subscriptions(&self) -> Vec<Subscription>;
    fn register_types(&self, registry: &mut MessageTypeRegistry);
    fn resolve(&self, message: &dyn Message) -> Result<SagaId, DomainError>;
    fn start(&self, message: &dyn Message, ctx: &mut SagaContext) -> Result<String, DomainError>;
    fn advance(
        &self,
        payload: &str,
        message: &dyn Message,
        ctx: &mut SagaContext,
    ) -> Result<String, DomainError>;
}

struct TypedRunner<S: Saga> {
    definition: SagaDefinition<S>,
}

impl<S: Saga> SagaRunner for TypedRunner<S> {
    fn saga_type(&self) -> &'static str {
        S::SAGA_TYPE
    }

    fn schema_version(&self) -> u32 {
        S::SCHEMA_VERSION
    }

    fn expiration(&self) -> RelativeOffset {
        self.definition.expiration()
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.definition.subscriptions()
    }

    fn register_types(&self, registry: &mut MessageTypeRegistry) {
        self.definition.register_types(registry);
    }

    fn resolve(&self, message: &dyn Message) -> Result<SagaId, DomainError> {
        self.definition.resolve(message)
    }

    fn start(&self, message: &dyn Message, ctx: &mut SagaContext) -> Result<String, DomainError> {
        let state = self.definition.start(message, ctx)?;
        Ok(serde_json::to_string(&state)?)
    }

    fn advance(
        &self,
        payload: &str,
        message: &dyn Message,
        ctx: &mut SagaContext,
    ) -> Result<String, DomainError> {
        let mut state: S = serde_json::from_str(payload).map_err(|e| {
            DomainError::Serialization(format!(
                "saga {} state could not be restored: {e}",
                ctx.saga_id()
            ))
        })?;
        self.definition.advance(&mut state, message, ctx)?;
        Ok(serde_json::to_string(&state)?)
    }
}

/// Collects saga types and validates them into a [`SagaEngine`].
pub struct SagaEngineBuilder {
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    runners: Vec<Arc<dyn SagaRunner>>,
    error: Option<ConfigurationError>,
}

impl SagaEngineBuilder {
    /// Adds saga type `S`.
    #[must_use]
    pub fn register<S: Saga>(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.runners.iter().any(|r| r.saga_type() == S::SAGA_TYPE) {
            self.error = Some(ConfigurationError::DuplicateSaga(S::SAGA_TYPE.to_owned()));
            return self;
        }
        let definition = S::definition();
        match definition.validate() {
            Ok(()) => self.runners.push(Arc::new(TypedRunner { definition })),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns the first invalid or duplicate definition, or
    /// `ConfigurationError::AmbiguousCommandHandler` when several saga types
    /// subscribe to the same command.
    pub fn build(self) -> Result<Arc<SagaEngine>, ConfigurationError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut routes: HashMap<&'static str, Vec<(usize, Subscription)>> = HashMap::new();
        for (index, runner) in self.runners.iter().enumerate() {
            for subscription in runner.subscriptions() {
                routes
                    .entry(subscription.message_type)
                    .or_default()
                    .push((index, subscription));
            }
        }
        if let Some((message_type, subscribers)) = routes.iter().find(|(_, subscribers)| {
            subscribers.len() > 1 && subscribers.iter().any(|(_, s)| s.kind == MessageKind::Command)
        }) {
            return Err(ConfigurationError::AmbiguousCommandHandler {
                message_type: (*message_type).to_owned(),
                count: subscribers.len(),
            });
        }
        info!(
            sagas = ?self.runners.iter().map(|r| r.saga_type()).collect::<Vec<_>>(),
            "Saga engine ready"
        );
        Ok(Arc::new(SagaEngine {
            store: self.store,
            clock: self.clock,
            runners: self.runners,
            routes,
        }))
    }
}

/// Routes messages to saga instances.
pub struct SagaEngine {
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    runners: Vec<Arc<dyn SagaRunner>>,
    routes: HashMap<&'static str, Vec<(usize, Subscription)>>,
}

impl std::fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("sagas", &self.saga_types())
            .finish_non_exhaustive()
    }
}

impl SagaEngine {
    /// Starts a builder over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn SagaStore>, clock: Arc<dyn Clock>) -> SagaEngineBuilder {
        SagaEngineBuilder {
            store,
            clock,
            runners: Vec::new(),
            error: None,
        }
    }

    /// Registered saga types, in registration order.
    #[must_use]
    pub fn saga_types(&self) -> Vec<&'static str> {
        self.runners.iter().map(|r| r.saga_type()).collect()
    }

    /// Opens a pass. The clock is read once; every saga touched in the pass
    /// sees the same time.
    #[must_use]
    pub fn session(&self) -> SagaSession<'_> {
        SagaSession {
            engine: self,
            now: self.clock.now(),
            touched: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Handles one message in its own pass and commits it.
    ///
    /// # Errors
    ///
    /// Returns the first routing, handler, store or publication error. A
    /// failed pass persists nothing.
    pub async fn handle(
        &self,
        message: &dyn Message,
        context: &dyn DeliveryContext,
    ) -> Result<(), DomainError> {
        let mut session = self.session();
        session.handle(message).await?;
        session.commit(context).await
    }

    /// Registers the lifecycle events and every handled message type for
    /// decoding.
    pub fn register_types(&self, registry: &mut MessageTypeRegistry) {
        register_lifecycle_events(registry);
        for runner in &self.runners {
            runner.register_types(registry);
        }
    }

    /// Dispatcher registrations: one per subscribed message type, with the
    /// role matching the message kind.
    #[must_use]
    pub fn registrations(self: &Arc<Self>) -> Vec<HandlerRegistration> {
        let kinds: BTreeMap<&'static str, MessageKind> = self
            .routes
            .iter()
            .filter_map(|(message_type, subscribers)| {
                subscribers.first().map(|(_, s)| (*message_type, s.kind))
            })
            .collect();
        kinds
            .into_iter()
            .map(|(message_type, kind)| {
                HandlerRegistration::for_handler(
                    message_type,
                    kind,
                    kind,
                    HANDLER_NAME,
                    Arc::new(SagaMessageHandler {
                        engine: Arc::clone(self),
                    }),
                )
            })
            .collect()
    }
}

struct SagaMessageHandler {
    engine: Arc<SagaEngine>,
}

#[async_trait]
impl MessageHandler for SagaMessageHandler {
    async fn handle(
        &self,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> Result<(), DomainError> {
        self.engine.handle(message.as_ref(), context.as_ref()).await
    }
}

struct Touched {
    saga: StoredSaga,
    is_new: bool,
}

/// One message-handling pass: the unit of work of the saga engine.
pub struct SagaSession<'e> {
    engine: &'e SagaEngine,
    now: DateTime<Utc>,
    touched: Vec<Touched>,
    outbound: Vec<Arc<dyn Message>>,
}

impl SagaSession<'_> {
    /// Routes `message` to every subscribed saga type.
    ///
    /// Returns how many saga types the message was routed to.
    ///
    /// # Errors
    ///
    /// - `DomainError::InvalidSagaIdentifier` if no identity can be resolved.
    /// - `DomainError::SagaNotFound` for a non-start message without saga.
    /// - `DomainError::DuplicateSaga` for a second start within the pass.
    /// - `DomainError::ClosedSaga` for a saga in a terminal status.
    /// - Any error raised by a saga handler or the store.
    pub async fn handle(&mut self, message: &dyn Message) -> Result<usize, DomainError> {
        let engine = self.engine;
        let Some(subscribers) = engine.routes.get(message.message_type()) else {
            return Ok(0);
        };
        for (index, subscription) in subscribers {
            self.route(engine.runners[*index].as_ref(), *subscription, message)
                .await?;
        }
        Ok(subscribers.len())
    }

    /// Sagas touched so far, in routing order.
    pub fn touched(&self) -> impl Iterator<Item = &StoredSaga> {
        self.touched.iter().map(|t| &t.saga)
    }

    /// Messages queued for publication so far.
    #[must_use]
    pub fn pending_messages(&self) -> &[Arc<dyn Message>] {
        &self.outbound
    }

    /// Persists every touched saga in one store commit, then publishes the
    /// queued messages in order.
    ///
    /// # Errors
    ///
    /// Returns the store's error (nothing is published) or the first
    /// publication error.
    pub async fn commit(self, context: &dyn DeliveryContext) -> Result<(), DomainError> {
        if self.touched.is_empty() {
            return publish_all(context, self.outbound).await;
        }
        let changes: Vec<SagaChange> = self
            .touched
            .into_iter()
            .map(|t| {
                if t.is_new {
                    SagaChange::Insert(t.saga)
                } else {
                    SagaChange::Update(t.saga)
                }
            })
            .collect();
        let count = changes.len();
        self.engine.store.commit(changes).await?;
        debug!(sagas = count, messages = self.outbound.len(), "Saga pass committed");
        publish_all(context, self.outbound).await
    }

    async fn route(
        &mut self,
        runner: &dyn SagaRunner,
        subscription: Subscription,
        message: &dyn Message,
    ) -> Result<(), DomainError> {
        // Identity is resolved before the store is touched.
        let id = runner.resolve(message)?;
        let position = match self.touched.iter().position(|t| t.saga.id == id) {
            Some(position) => Some(position),
            None if subscription.advances => self.load(runner, &id).await?,
            None => None,
        };
        match position {
            Some(_) if !subscription.advances => Err(DomainError::DuplicateSaga(id.composite_key())),
            Some(position) => self.advance(runner, position, message),
            None if subscription.starts => self.start(runner, id, message),
            None => Err(DomainError::SagaNotFound(id.composite_key())),
        }
    }

    async fn load(&mut self, runner: &dyn SagaRunner, id: &SagaId) -> Result<Option<usize>, DomainError> {
        let Some(saga) = self.engine.store.load(id).await? else {
            return Ok(None);
        };
        if saga.schema_version != runner.schema_version() {
            return Err(DomainError::Serialization(format!(
                "saga {id} was stored with schema {}, current schema is {}",
                saga.schema_version,
                runner.schema_version()
            )));
        }
        self.touched.push(Touched {
            saga,
            is_new: false,
        });
        Ok(Some(self.touched.len() - 1))
    }

    fn start(
        &mut self,
        runner: &dyn SagaRunner,
        id: SagaId,
        message: &dyn Message,
    ) -> Result<(), DomainError> {
        let mut ctx = SagaContext::new(id.clone(), self.now);
        let payload = runner.start(message, &mut ctx)?;
        let mut saga = StoredSaga {
            id,
            status: SagaStatus::InProgress,
            schema_version: runner.schema_version(),
            payload,
            created_at: self.now,
            expire_at: runner.expiration().apply(self.now)?,
            closed_at: None,
            closing_reason: None,
            revision: 0,
        };
        self.outbound.push(Arc::new(SagaCreated {
            saga_type: saga.id.saga_type().to_owned(),
            saga_id: saga.id.as_str().to_owned(),
            created_at: saga.created_at,
            expire_at: saga.expire_at,
        }));
        let (outbound, transition) = ctx.into_parts();
        self.outbound.extend(outbound);
        if let Some(transition) = transition {
            self.outbound
                .extend(close(&mut saga, transition.status, transition.reason, self.now));
        }
        debug!(saga = %saga.id, trigger = message.message_type(), "Saga started");
        self.touched.push(Touched { saga, is_new: true });
        Ok(())
    }

    fn advance(
        &mut self,
        runner: &dyn SagaRunner,
        position: usize,
        message: &dyn Message,
    ) -> Result<(), DomainError> {
        let now = self.now;
        let saga = &mut self.touched[position].saga;
        if saga.status.is_terminal() {
            return Err(DomainError::ClosedSaga(saga.id.composite_key()));
        }
        if saga.is_expired_at(now) {
            info!(saga = %saga.id, expire_at = %saga.expire_at, "Saga expired");
            self.outbound.extend(close(
                saga,
                SagaStatus::Failed,
                Some(EXPIRED_REASON.to_owned()),
                now,
            ));
            return Ok(());
        }
        let mut ctx = SagaContext::new(saga.id.clone(), now);
        saga.payload = runner.advance(&saga.payload, message, &mut ctx)?;
        let (outbound, transition) = ctx.into_parts();
        self.outbound.extend(outbound);
        if let Some(transition) = transition {
            self.outbound
                .extend(close(saga, transition.status, transition.reason, now));
        }
        debug!(saga = %saga.id, message_type = message.message_type(), status = %saga.status, "Saga advanced");
        Ok(())
    }
}

fn close(
    saga: &mut StoredSaga,
    status: SagaStatus,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Vec<Arc<dyn Message>> {
    let from = saga.status;
    saga.status = status;
    saga.closed_at = Some(now);
    saga.closing_reason.clone_from(&reason);
    info!(saga = %saga.id, %from, to = %status, reason = reason.as_deref().unwrap_or(""), "Saga closed");
    vec![
        Arc::new(SagaStatusChanged {
            saga_type: saga.id.saga_type().to_owned(),
            saga_id: saga.id.as_str().to_owned(),
            from,
            to: status,
            reason: reason.clone(),
        }),
        Arc::new(SagaClosed {
            saga_type: saga.id.saga_type().to_owned(),
            saga_id: saga.id.as_str().to_owned(),
            status,
            reason,
            closed_at: now,
        }),
    ]
}
