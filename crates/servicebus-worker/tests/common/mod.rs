//! Shared helpers for worker integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::context::DeliveryOptions;
use servicebus_core::error::DomainError;
use servicebus_core::handler::HandlerRegistration;
use servicebus_core::message::{Message, MessageContract, MessageKind};
use servicebus_core::metadata::Metadata;
use servicebus_sagas::definition::{Saga, SagaDefinition};
use servicebus_sagas::engine::SagaEngine;
use servicebus_sagas::scheduler::InMemorySchedulerStore;
use servicebus_sagas::store::InMemorySagaStore;
use servicebus_test_support::ManualClock;
use servicebus_worker::config::WorkerConfig;
use servicebus_worker::kernel::Kernel;
use servicebus_worker::transport::{InMemoryTransport, Settlement, Transport};
use servicebus_worker::worker::Worker;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveTable {
    pub reservation_id: String,
    pub guests: u32,
}

impl MessageContract for ReserveTable {
    const MESSAGE_TYPE: &'static str = "diner.reserve_table";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmTable {
    pub reservation_id: String,
}

impl MessageContract for ConfirmTable {
    const MESSAGE_TYPE: &'static str = "diner.confirm_table";
    const KIND: MessageKind = MessageKind::Command;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfirmed {
    pub reservation_id: String,
}

impl MessageContract for TableConfirmed {
    const MESSAGE_TYPE: &'static str = "diner.table_confirmed";
    const KIND: MessageKind = MessageKind::Event;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemindGuest {
    pub reservation_id: String,
}

impl MessageContract for RemindGuest {
    const MESSAGE_TYPE: &'static str = "diner.remind_guest";
    const KIND: MessageKind = MessageKind::Command;
}

/// Reservation saga: asks for confirmation, completes once confirmed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub guests: u32,
    pub confirmed: bool,
}

impl Saga for Reservation {
    const SAGA_TYPE: &'static str = "reservation";

    fn definition() -> SagaDefinition<Self> {
        SagaDefinition::new("reservation_id")
            .started_by::<ReserveTable, _>(|command, ctx| {
                ctx.fire(ConfirmTable {
                    reservation_id: command.reservation_id.clone(),
                });
                Ok(Self {
                    reservation_id: command.reservation_id.clone(),
                    guests: command.guests,
                    confirmed: false,
                })
            })
            .on::<TableConfirmed, _>(|saga, _event, ctx| {
                saga.confirmed = true;
                ctx.complete();
                Ok(())
            })
    }
}

/// Fixed start time used across the worker tests.
pub fn start_of_service() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap()
}

/// Fully wired worker over in-memory infrastructure.
pub struct Harness {
    pub worker: Arc<Worker>,
    pub transport: Arc<InMemoryTransport>,
    pub saga_store: Arc<InMemorySagaStore>,
    pub clock: Arc<ManualClock>,
    pub reminders: Arc<AtomicU32>,
}

impl Harness {
    /// Harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorkerConfig {
            retry: servicebus_worker::config::RetrySettings {
                max_attempts: 2,
                delay_ms: 1,
            },
            ..WorkerConfig::default()
        })
    }

    /// Harness with `config`.
    pub fn with_config(config: WorkerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_of_service()));
        let saga_store = Arc::new(InMemorySagaStore::new());
        let engine = SagaEngine::builder(saga_store.clone(), clock.clone())
            .register::<Reservation>()
            .build()
            .unwrap();
        let reminders = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&reminders);

        let kernel = Kernel::builder(config)
            .with_clock(clock.clone())
            .message::<ConfirmTable>()
            .message::<RemindGuest>()
            .handler(HandlerRegistration::command::<ConfirmTable, _, _>(
                "front-desk",
                |command, ctx| async move {
                    ctx.publish(
                        Arc::new(TableConfirmed {
                            reservation_id: command.reservation_id,
                        }),
                        DeliveryOptions::default(),
                    )
                    .await
                },
            ))
            .handler(HandlerRegistration::command::<RemindGuest, _, _>(
                "reminders",
                move |_, _| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), DomainError>(())
                    }
                },
            ))
            .require_command::<ReserveTable>()
            .require_command::<ConfirmTable>()
            .with_saga_engine(engine)
            .with_scheduler_store(Arc::new(InMemorySchedulerStore::new()))
            .build()
            .unwrap();

        let transport = Arc::new(InMemoryTransport::new());
        let worker = Arc::new(Worker::new(Arc::new(kernel), transport.clone()));
        Self {
            worker,
            transport,
            saga_store,
            clock,
            reminders,
        }
    }

    /// Encodes `message` under a new trace id and queues it.
    pub async fn send(&self, message: &dyn Message) -> Uuid {
        let trace_id = Uuid::new_v4();
        self.send_with(message, Metadata::new(trace_id)).await;
        trace_id
    }

    /// Encodes `message` with `metadata` and queues it.
    pub async fn send_with(&self, message: &dyn Message, metadata: Metadata) {
        let encoded = self
            .worker
            .kernel()
            .serializer()
            .encode(message, &metadata)
            .unwrap();
        self.transport.send(encoded).await.unwrap();
    }

    /// Processes queued deliveries, including the ones they produce, until
    /// the queue is empty. Returns every settlement in order.
    pub async fn pump(&self) -> Vec<Settlement> {
        let mut settlements = Vec::new();
        while let Some(delivery) = self.transport.try_receive().await {
            settlements.push(self.worker.process(delivery).await.unwrap());
        }
        settlements
    }
}
