//! Test handlers: `MessageHandler` doubles that fail on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use servicebus_core::context::{DeliveryContext, DeliveryOptions};
use servicebus_core::error::DomainError;
use servicebus_core::handler::MessageHandler;
use servicebus_core::message::Message;

/// A handler that always fails with the error produced by `make_error`.
pub struct FailingHandler {
    make_error: Box<dyn Fn() -> DomainError + Send + Sync>,
    calls: AtomicU32,
}

impl FailingHandler {
    /// Create a handler failing with `make_error()` on every call.
    pub fn new(make_error: impl Fn() -> DomainError + Send + Sync + 'static) -> Self {
        Self {
            make_error: Box::new(make_error),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler ran.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FailingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingHandler")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(
        &self,
        _message: Arc<dyn Message>,
        _context: Arc<dyn DeliveryContext>,
    ) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make_error)())
    }
}

/// A handler that fails its first `failures` calls with an infrastructure
/// error, then succeeds. Every call first publishes a copy of the inbound
/// message so tests can observe which attempt's output was kept.
#[derive(Debug)]
pub struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    /// Create a handler that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler ran.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(
        &self,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> Result<(), DomainError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        context.publish(message, DeliveryOptions::default()).await?;
        if call <= self.failures {
            return Err(DomainError::Infrastructure(format!(
                "flaky failure on call {call}"
            )));
        }
        Ok(())
    }
}
