//! Kernel assembly.
//!
//! The builder gathers message types, handlers, the saga engine and the
//! scheduler store, then validates the whole wiring once. A kernel that
//! builds can route and decode every message it has a handler for.

use std::sync::Arc;

use servicebus_core::error::ConfigurationError;
use servicebus_core::handler::HandlerRegistration;
use servicebus_core::message::MessageContract;
use servicebus_core::serializer::{JsonMessageSerializer, MessageSerializer, MessageTypeRegistry};
use servicebus_core::time::{Clock, SystemClock};
use servicebus_dispatcher::bus::MessageBus;
use servicebus_dispatcher::registry::{HandlerRegistry, HandlerRegistryBuilder};
use servicebus_event_sourcing::snapshot::{SnapshotStore, Snapshotter, VersionIncreaseTrigger};
use servicebus_sagas::engine::SagaEngine;
use servicebus_sagas::scheduler::{Scheduler, SchedulerStore, register_scheduler_events};
use tracing::info;

use crate::config::WorkerConfig;

/// Collects the kernel's parts.
pub struct KernelBuilder {
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    types: MessageTypeRegistry,
    handlers: HandlerRegistryBuilder,
    saga_engine: Option<Arc<SagaEngine>>,
    scheduler_store: Option<Arc<dyn SchedulerStore>>,
}

impl KernelBuilder {
    /// Replaces the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Makes `M` decodable from the transport.
    #[must_use]
    pub fn message<M: MessageContract>(mut self) -> Self {
        self.types.register::<M>();
        self
    }

    /// Adds a handler. Its message type must also be registered with
    /// [`KernelBuilder::message`].
    #[must_use]
    pub fn handler(mut self, registration: HandlerRegistration) -> Self {
        self.handlers = self.handlers.register(registration);
        self
    }

    /// Declares that command `C` must have a handler.
    #[must_use]
    pub fn require_command<C: MessageContract>(mut self) -> Self {
        self.handlers = self.handlers.require_command::<C>();
        self
    }

    /// Routes saga messages to `engine`. The engine's message types are
    /// registered automatically.
    #[must_use]
    pub fn with_saga_engine(mut self, engine: Arc<SagaEngine>) -> Self {
        self.saga_engine = Some(engine);
        self
    }

    /// Enables the scheduler.
    #[must_use]
    pub fn with_scheduler_store(mut self, store: Arc<dyn SchedulerStore>) -> Self {
        self.scheduler_store = Some(store);
        self
    }

    /// Validates the wiring and builds the kernel.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigurationError` found in the handler registry,
    /// the retry settings or the decodability check.
    pub fn build(self) -> Result<Kernel, ConfigurationError> {
        let Self {
            config,
            clock,
            mut types,
            mut handlers,
            saga_engine,
            scheduler_store,
        } = self;

        if let Some(engine) = &saga_engine {
            engine.register_types(&mut types);
            handlers = handlers.register_all(engine.registrations());
        }
        if scheduler_store.is_some() {
            register_scheduler_events(&mut types);
        }

        let registry = handlers.build()?;
        registry.ensure_decodable(&types)?;

        let mut bus = MessageBus::new(registry).with_default_retry(config.retry_policy()?);
        if let Some(timeout) = config.handler_timeout() {
            bus = bus.with_default_timeout(timeout);
        }

        let types = Arc::new(types);
        let scheduler = scheduler_store.map(|store| {
            Arc::new(Scheduler::new(store, Arc::clone(&types), Arc::clone(&clock)))
        });

        info!(
            service = %config.service_name,
            message_types = types.namespaces().len(),
            sagas = saga_engine.as_ref().map_or(0, |e| e.saga_types().len()),
            scheduler = scheduler.is_some(),
            "Kernel built"
        );
        Ok(Kernel {
            serializer: Arc::new(JsonMessageSerializer::new(Arc::clone(&types))),
            config,
            clock,
            types,
            bus,
            saga_engine,
            scheduler,
        })
    }
}

/// A validated kernel: bus, serializer and optional saga engine and scheduler.
pub struct Kernel {
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    types: Arc<MessageTypeRegistry>,
    serializer: Arc<JsonMessageSerializer>,
    bus: MessageBus,
    saga_engine: Option<Arc<SagaEngine>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl Kernel {
    /// Starts a builder using the system clock.
    #[must_use]
    pub fn builder(config: WorkerConfig) -> KernelBuilder {
        KernelBuilder {
            config,
            clock: Arc::new(SystemClock),
            types: MessageTypeRegistry::new(),
            handlers: HandlerRegistry::builder(),
            saga_engine: None,
            scheduler_store: None,
        }
    }

    /// Configuration the kernel was built with.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The kernel clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Decodable message types.
    #[must_use]
    pub fn types(&self) -> &MessageTypeRegistry {
        &self.types
    }

    /// Serializer shared by inbound decoding and outbound publishing.
    #[must_use]
    pub fn serializer(&self) -> Arc<dyn MessageSerializer> {
        Arc::clone(&self.serializer) as Arc<dyn MessageSerializer>
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The saga engine, when one was registered.
    #[must_use]
    pub fn saga_engine(&self) -> Option<&Arc<SagaEngine>> {
        self.saga_engine.as_ref()
    }

    /// The scheduler, when a scheduler store was supplied.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Snapshotter over `store`, triggered every `snapshot_interval`
    /// versions.
    #[must_use]
    pub fn snapshotter(&self, store: Arc<dyn SnapshotStore>) -> Arc<Snapshotter> {
        Arc::new(Snapshotter::new(
            store,
            Arc::new(VersionIncreaseTrigger::new(self.config.snapshot_interval)),
            Arc::clone(&self.clock),
        ))
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("service", &self.config.service_name)
            .field("types", &self.types)
            .field("sagas", &self.saga_engine.as_ref().map(|e| e.saga_types()))
            .finish_non_exhaustive()
    }
}
