//! The message bus: resolves handlers and runs the dispatch pipeline.
//!
//! Per handler the pipeline is validation, then execution (retried and
//! optionally time-limited), then the flush of buffered outbound messages.
//! Validation is fail-soft: an invalid message is acknowledged and a
//! [`MessageValidationFailed`] event is published instead of running the
//! handler. Listeners of one event run independently; a failing listener does
//! not stop its siblings, but it does make the delivery fail so the transport
//! can redeliver or dead-letter it.

use std::sync::Arc;
use std::time::Duration;

use servicebus_core::context::{DeliveryContext, DeliveryOptions};
use servicebus_core::error::{DomainError, ErrorKind};
use servicebus_core::handler::HandlerRegistration;
use servicebus_core::message::{Message, MessageKind};
use servicebus_core::metadata::Metadata;
use servicebus_core::retry::{RetryExecutor, RetryPolicy};
use servicebus_core::validation::MessageValidationFailed;
use tracing::{debug, error, info};

use crate::attempt::AttemptContext;
use crate::registry::HandlerRegistry;

/// A handler that gave up on the delivery.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Registration name of the handler.
    pub handler: String,
    /// Attempts made.
    pub attempts: u32,
    /// The last error.
    pub error: DomainError,
    /// Inbound envelope tagged with the failure origin and retry count.
    pub metadata: Metadata,
}

impl HandlerFailure {
    /// Whether another delivery could succeed without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.error.kind(), ErrorKind::Concurrency)
    }
}

/// Result of one dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every resolved handler succeeded or rejected the message as invalid.
    Acknowledged {
        /// Handlers that ran to completion.
        handled: usize,
        /// Handlers skipped because the message failed validation.
        validation_failures: usize,
    },
    /// At least one handler failed after its retries.
    Rejected {
        /// Handlers that ran to completion.
        handled: usize,
        /// The failures, in handler order.
        failures: Vec<HandlerFailure>,
    },
    /// A command with no handler.
    Unroutable {
        /// Namespace of the command.
        message_type: String,
    },
}

impl DispatchOutcome {
    /// Returns `true` for [`DispatchOutcome::Acknowledged`].
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }

    /// Failures of a rejected dispatch; empty otherwise.
    #[must_use]
    pub fn failures(&self) -> &[HandlerFailure] {
        match self {
            Self::Rejected { failures, .. } => failures,
            _ => &[],
        }
    }
}

enum HandlerResult {
    Handled,
    Invalid,
    Failed(HandlerFailure),
}

/// Routes messages to their registered handlers.
#[derive(Debug)]
pub struct MessageBus {
    registry: HandlerRegistry,
    default_retry: RetryPolicy,
    default_timeout: Option<Duration>,
}

impl MessageBus {
    /// Creates a bus over a validated registry. Handlers without their own
    /// retry policy get a single attempt.
    #[must_use]
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            default_retry: RetryPolicy::single_attempt(),
            default_timeout: None,
        }
    }

    /// Retry policy for handlers that do not declare one.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Timeout for handlers that do not declare one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// The routing table.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Dispatches `message` to its handler (command) or listeners (event).
    pub async fn dispatch(
        &self,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> DispatchOutcome {
        let message_type = message.message_type();
        let trace_id = context.trace_id();
        debug!(%trace_id, message_type, kind = %message.kind(), "Dispatching message");

        let registrations: Vec<&HandlerRegistration> = match message.kind() {
            MessageKind::Command => match self.registry.command_handler(message_type) {
                Some(registration) => vec![registration],
                None => {
                    error!(%trace_id, message_type, "No handler registered for command");
                    return DispatchOutcome::Unroutable {
                        message_type: message_type.to_owned(),
                    };
                }
            },
            MessageKind::Event => self.registry.listeners(message_type).iter().collect(),
        };

        let mut handled = 0;
        let mut validation_failures = 0;
        let mut failures = Vec::new();
        for registration in registrations {
            match self
                .run_handler(registration, Arc::clone(&message), Arc::clone(&context))
                .await
            {
                HandlerResult::Handled => handled += 1,
                HandlerResult::Invalid => validation_failures += 1,
                HandlerResult::Failed(failure) => failures.push(failure),
            }
        }

        if failures.is_empty() {
            debug!(%trace_id, message_type, handled, validation_failures, "Message acknowledged");
            DispatchOutcome::Acknowledged {
                handled,
                validation_failures,
            }
        } else {
            DispatchOutcome::Rejected { handled, failures }
        }
    }

    async fn run_handler(
        &self,
        registration: &HandlerRegistration,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> HandlerResult {
        let name = registration.name.as_str();
        let trace_id = context.trace_id();

        if let Some(validator) = &registration.validator {
            let violations =
                validator.validate(message.as_ref(), &registration.options.validation_groups);
            if !violations.is_empty() {
                info!(
                    %trace_id,
                    handler = name,
                    message_type = message.message_type(),
                    violations = violations.len(),
                    "Message failed validation"
                );
                let event =
                    MessageValidationFailed::new(trace_id, message.message_type(), &violations);
                return match context
                    .publish(Arc::new(event), DeliveryOptions::default())
                    .await
                {
                    Ok(()) => HandlerResult::Invalid,
                    Err(e) => HandlerResult::Failed(failure(name, 1, e, context.metadata())),
                };
            }
        }

        let policy = registration
            .options
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let timeout = registration.options.timeout.or(self.default_timeout);
        let executor = RetryExecutor::new(policy);
        let result = executor
            .run(|attempt| {
                let handler = Arc::clone(&registration.handler);
                let message = Arc::clone(&message);
                let attempt_context =
                    Arc::new(AttemptContext::new(Arc::clone(&context), name, attempt));
                async move {
                    let run = handler.handle(message, Arc::clone(&attempt_context) as Arc<dyn DeliveryContext>);
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                            DomainError::Timeout {
                                handler: name.to_owned(),
                                timeout_ms: limit.as_millis(),
                            }
                        })??,
                        None => run.await?,
                    }
                    Ok::<_, DomainError>(attempt_context.take().await)
                }
            })
            .await;

        match result {
            Ok(attempted) => {
                if let Err(e) = AttemptContext::flush(context.as_ref(), attempted.value).await {
                    return HandlerResult::Failed(failure(
                        name,
                        attempted.attempts,
                        e,
                        context.metadata(),
                    ));
                }
                debug!(%trace_id, handler = name, attempts = attempted.attempts, "Handler succeeded");
                HandlerResult::Handled
            }
            Err(retry_error) => {
                error!(
                    %trace_id,
                    handler = name,
                    message_type = message.message_type(),
                    attempts = retry_error.attempts,
                    error = %retry_error.source,
                    "Handler failed"
                );
                HandlerResult::Failed(failure(
                    name,
                    retry_error.attempts,
                    retry_error.source,
                    context.metadata(),
                ))
            }
        }
    }
}

fn failure(handler: &str, attempts: u32, error: DomainError, inbound: &Metadata) -> HandlerFailure {
    let metadata = inbound
        .with_retry_count(inbound.retry_count().saturating_add(attempts.saturating_sub(1)))
        .with_failure_origin(handler);
    HandlerFailure {
        handler: handler.to_owned(),
        attempts,
        error,
        metadata,
    }
}
