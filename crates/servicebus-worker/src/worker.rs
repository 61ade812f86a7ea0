//! The decode, dispatch and settle loop.
//!
//! At most `concurrency` deliveries are processed at the same time. A
//! shutdown signal stops the intake; deliveries already in flight are
//! finished and settled before [`Worker::run`] returns.

use std::sync::Arc;

use servicebus_core::context::DeliveryContext;
use servicebus_core::error::DomainError;
use servicebus_core::metadata::Metadata;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::TransportDeliveryContext;
use crate::kernel::Kernel;
use crate::transport::{IncomingDelivery, Settlement, Transport};

/// Pulls deliveries from a transport and runs them through the kernel.
pub struct Worker {
    kernel: Arc<Kernel>,
    transport: Arc<dyn Transport>,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub fn new(kernel: Arc<Kernel>, transport: Arc<dyn Transport>) -> Self {
        Self { kernel, transport }
    }

    /// The kernel deliveries are dispatched through.
    #[must_use]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn context(&self, metadata: Metadata) -> Arc<dyn DeliveryContext> {
        Arc::new(TransportDeliveryContext::new(
            metadata,
            Arc::clone(&self.transport),
            self.kernel.serializer(),
        ))
    }

    /// Decodes and dispatches one delivery and decides its settlement.
    /// Undecodable payloads are rejected without dispatch.
    pub async fn handle_delivery(&self, delivery: &IncomingDelivery) -> Settlement {
        let decoded = match self
            .kernel
            .serializer()
            .decode(&delivery.payload, &delivery.metadata)
        {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(delivery_id = delivery.delivery_id, error = %e, "Undecodable delivery");
                return Settlement::Reject {
                    reason: format!("undecodable payload: {e}"),
                };
            }
        };

        let message_type = decoded.message.message_type();
        let context = self.context(decoded.metadata);
        let outcome = self.kernel.bus().dispatch(decoded.message, context).await;
        let settlement = Settlement::for_outcome(&outcome, self.kernel.config().max_redeliveries);
        debug!(
            delivery_id = delivery.delivery_id,
            message_type,
            ?settlement,
            "Delivery processed"
        );
        settlement
    }

    /// Processes one delivery and settles it with the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's settlement error.
    pub async fn process(&self, delivery: IncomingDelivery) -> Result<Settlement, DomainError> {
        let settlement = self.handle_delivery(&delivery).await;
        self.transport.settle(&delivery, settlement.clone()).await?;
        Ok(settlement)
    }

    /// Emits every due scheduled operation. Returns 0 without a scheduler.
    ///
    /// # Errors
    ///
    /// Returns the scheduler's store, decoding or publication error.
    pub async fn tick_scheduler(&self) -> Result<usize, DomainError> {
        let Some(scheduler) = self.kernel.scheduler() else {
            return Ok(0);
        };
        let context = self.context(Metadata::generate());
        scheduler.emit_due(context.as_ref()).await
    }

    /// Runs until `shutdown` flips or the transport closes.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the concurrency limiter is
    /// closed. Failures of individual deliveries are logged, not returned.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DomainError> {
        let config = self.kernel.config();
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let mut tasks = JoinSet::new();
        let scheduler = self.kernel.scheduler().is_some().then(|| {
            tokio::spawn(Arc::clone(&self).run_scheduler(shutdown.clone()))
        });
        info!(
            service = %config.service_name,
            concurrency = config.concurrency,
            "Worker started"
        );

        while !*shutdown.borrow_and_update() {
            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    log_stop_reason(changed, "intake");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| DomainError::Infrastructure(format!("concurrency limiter closed: {e}")))?,
            };
            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    log_stop_reason(changed, "intake");
                    break;
                }
                delivery = self.transport.receive() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        info!("Transport closed");
                        break;
                    }
                },
            };

            let worker = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(delivery).await
            });
            while let Some(joined) = tasks.try_join_next() {
                report(joined);
            }
        }

        info!(in_flight = tasks.len(), "Worker stopping");
        while let Some(joined) = tasks.join_next().await {
            report(joined);
        }
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task failed");
            }
        }
        info!("Worker stopped");
        Ok(())
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.kernel.config().scheduler_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                changed = shutdown.changed() => {
                    log_stop_reason(changed, "scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_scheduler().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }
}

fn log_stop_reason(changed: Result<(), watch::error::RecvError>, task: &'static str) {
    match changed {
        Ok(()) => debug!(task, "Shutdown signaled"),
        Err(_) => debug!(task, "Shutdown sender dropped, stopping"),
    }
}

fn report(joined: Result<Result<Settlement, DomainError>, JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Settlement failed"),
        Err(e) => error!(error = %e, "Delivery task failed"),
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
