//! Handler contracts and registration descriptors.
//!
//! Handlers are registered explicitly at startup through
//! [`HandlerRegistration`] values; nothing is discovered at runtime.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::DeliveryContext;
use crate::error::DomainError;
use crate::message::{Message, MessageContract, MessageKind, downcast};
use crate::retry::RetryPolicy;
use crate::validation::MessageValidator;

/// Object-safe message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. Outbound messages go through `context`.
    ///
    /// # Errors
    ///
    /// Returns any failure; the dispatcher decides whether to retry it.
    async fn handle(
        &self,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> Result<(), DomainError>;
}

struct TypedHandler<M, F> {
    f: F,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, F, Fut> MessageHandler for TypedHandler<M, F>
where
    M: MessageContract,
    F: Fn(M, Arc<dyn DeliveryContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: Arc<dyn Message>,
        context: Arc<dyn DeliveryContext>,
    ) -> Result<(), DomainError> {
        let typed = downcast::<M>(message.as_ref()).cloned().ok_or_else(|| {
            DomainError::Handler(format!(
                "expected {} but received {}",
                M::MESSAGE_TYPE,
                message.message_type()
            ))
        })?;
        (self.f)(typed, context).await
    }
}

/// Wraps an async closure taking a concrete message type.
pub fn handler_fn<M, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    M: MessageContract,
    F: Fn(M, Arc<dyn DeliveryContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _message: PhantomData,
    })
}

/// Per-handler execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Validation groups passed to the message's validator.
    pub validation_groups: Vec<String>,
    /// Abandon an attempt that runs longer than this.
    pub timeout: Option<Duration>,
    /// Retry policy; the dispatcher default applies when `None`.
    pub retry: Option<RetryPolicy>,
}

impl HandlerOptions {
    /// Sets the validation groups.
    #[must_use]
    pub fn with_validation_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validation_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Describes one handler bound to one message type.
#[derive(Clone)]
pub struct HandlerRegistration {
    /// Namespace of the handled message.
    pub message_type: &'static str,
    /// Kind declared by the message contract.
    pub declared_kind: MessageKind,
    /// Role the handler was registered under (command handler or listener).
    pub role: MessageKind,
    /// Name used in logs and failure metadata.
    pub name: String,
    /// The handler itself.
    pub handler: Arc<dyn MessageHandler>,
    /// Validator run before execution, if any.
    pub validator: Option<Arc<dyn MessageValidator>>,
    /// Execution options.
    pub options: HandlerOptions,
}

impl HandlerRegistration {
    /// Registers the single handler of command `M`.
    pub fn command<M, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        M: MessageContract,
        F: Fn(M, Arc<dyn DeliveryContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
    {
        Self::for_handler(
            M::MESSAGE_TYPE,
            M::KIND,
            MessageKind::Command,
            name,
            handler_fn(f),
        )
    }

    /// Registers a listener of event `M`.
    pub fn listener<M, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        M: MessageContract,
        F: Fn(M, Arc<dyn DeliveryContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
    {
        Self::for_handler(
            M::MESSAGE_TYPE,
            M::KIND,
            MessageKind::Event,
            name,
            handler_fn(f),
        )
    }

    /// Registers an already type-erased handler.
    pub fn for_handler(
        message_type: &'static str,
        declared_kind: MessageKind,
        role: MessageKind,
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            message_type,
            declared_kind,
            role,
            name: name.into(),
            handler,
            validator: None,
            options: HandlerOptions::default(),
        }
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn with_options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    /// Attaches a validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("message_type", &self.message_type)
            .field("declared_kind", &self.declared_kind)
            .field("role", &self.role)
            .field("name", &self.name)
            .field("validated", &self.validator.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::context::DeliveryOptions;
    use crate::metadata::Metadata;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl MessageContract for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong;

    impl MessageContract for Pong {
        const MESSAGE_TYPE: &'static str = "test.pong";
        const KIND: MessageKind = MessageKind::Event;
    }

    struct SinkContext {
        metadata: Metadata,
        published: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DeliveryContext for SinkContext {
        fn metadata(&self) -> &Metadata {
            &self.metadata
        }

        async fn publish(
            &self,
            message: Arc<dyn Message>,
            _options: DeliveryOptions,
        ) -> Result<(), DomainError> {
            self.published.lock().unwrap().push(message.message_type());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_typed_handler_receives_concrete_message() {
        // Arrange
        let registration = HandlerRegistration::command::<Ping, _, _>("ping", |ping, ctx| async move {
            for _ in 0..ping.n {
                ctx.publish(Arc::new(Pong), DeliveryOptions::default()).await?;
            }
            Ok::<(), DomainError>(())
        });
        let context = Arc::new(SinkContext {
            metadata: Metadata::generate(),
            published: Mutex::new(Vec::new()),
        });

        // Act
        registration
            .handler
            .handle(Arc::new(Ping { n: 2 }), context.clone())
            .await
            .unwrap();

        // Assert
        assert_eq!(*context.published.lock().unwrap(), vec!["test.pong", "test.pong"]);
        assert_eq!(registration.role, MessageKind::Command);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_foreign_message() {
        let handler = handler_fn::<Ping, _, _>(|_, _| async { Ok(()) });
        let context = Arc::new(SinkContext {
            metadata: Metadata::generate(),
            published: Mutex::new(Vec::new()),
        });

        let err = handler.handle(Arc::new(Pong), context).await.unwrap_err();

        assert!(err.to_string().contains("expected test.ping"));
    }

    #[test]
    fn test_listener_records_declared_kind_separately_from_role() {
        let registration = HandlerRegistration::listener::<Ping, _, _>("oops", |_, _| async { Ok(()) })
            .with_options(HandlerOptions::default().with_timeout(Duration::from_secs(1)));

        assert_eq!(registration.declared_kind, MessageKind::Command);
        assert_eq!(registration.role, MessageKind::Event);
        assert_eq!(registration.options.timeout, Some(Duration::from_secs(1)));
    }
}
