//! Handler registry.
//!
//! Registrations are explicit and validated at build time. A command resolves
//! to exactly one handler; an event resolves to any number of listeners, kept
//! in registration order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use servicebus_core::error::ConfigurationError;
use servicebus_core::handler::HandlerRegistration;
use servicebus_core::message::{MessageContract, MessageKind};
use servicebus_core::serializer::MessageTypeRegistry;
use tracing::info;

/// Collects registrations and validates them into a [`HandlerRegistry`].
#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<HandlerRegistration>,
    required_commands: BTreeSet<&'static str>,
}

impl HandlerRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one registration.
    #[must_use]
    pub fn register(mut self, registration: HandlerRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Adds several registrations, e.g. those produced by the saga engine.
    #[must_use]
    pub fn register_all(mut self, registrations: impl IntoIterator<Item = HandlerRegistration>) -> Self {
        self.registrations.extend(registrations);
        self
    }

    /// Declares that the service accepts command `C`, so a missing handler
    /// fails the build.
    #[must_use]
    pub fn require_command<C: MessageContract>(self) -> Self {
        self.require(C::MESSAGE_TYPE)
    }

    /// Declares an accepted command by namespace.
    #[must_use]
    pub fn require(mut self, message_type: &'static str) -> Self {
        self.required_commands.insert(message_type);
        self
    }

    /// Validates the registrations.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::KindMismatch` when a handler's role contradicts
    ///   the message's declared kind.
    /// - `ConfigurationError::ConflictingMessageKind` when a namespace is
    ///   registered both as a command and as an event.
    /// - `ConfigurationError::AmbiguousCommandHandler` when a command has
    ///   several handlers.
    /// - `ConfigurationError::MissingCommandHandler` when a required command
    ///   has none.
    pub fn build(self) -> Result<HandlerRegistry, ConfigurationError> {
        if let Some(mismatch) = self
            .registrations
            .iter()
            .find(|r| r.role != r.declared_kind)
        {
            return Err(ConfigurationError::KindMismatch {
                handler: mismatch.name.clone(),
                message_type: mismatch.message_type.to_owned(),
                registered: mismatch.role.to_string(),
                declared: mismatch.declared_kind.to_string(),
            });
        }

        let mut by_type: BTreeMap<&'static str, Vec<HandlerRegistration>> = BTreeMap::new();
        for registration in self.registrations {
            by_type
                .entry(registration.message_type)
                .or_default()
                .push(registration);
        }

        let mut commands = HashMap::new();
        let mut listeners = HashMap::new();
        for (message_type, registrations) in by_type {
            let kind = registrations[0].role;
            if registrations.iter().any(|r| r.role != kind) {
                return Err(ConfigurationError::ConflictingMessageKind(
                    message_type.to_owned(),
                ));
            }
            match kind {
                MessageKind::Command if registrations.len() > 1 => {
                    return Err(ConfigurationError::AmbiguousCommandHandler {
                        message_type: message_type.to_owned(),
                        count: registrations.len(),
                    });
                }
                MessageKind::Command => {
                    commands.extend(registrations.into_iter().map(|r| (message_type, r)));
                }
                MessageKind::Event => {
                    listeners.insert(message_type, registrations);
                }
            }
        }

        if let Some(missing) = self
            .required_commands
            .iter()
            .find(|ns| !commands.contains_key(**ns))
        {
            return Err(ConfigurationError::MissingCommandHandler((*missing).to_owned()));
        }

        info!(
            commands = commands.len(),
            events = listeners.len(),
            "Handler registry built"
        );
        Ok(HandlerRegistry {
            commands,
            listeners,
        })
    }
}

/// Validated routing table.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    commands: HashMap<&'static str, HandlerRegistration>,
    listeners: HashMap<&'static str, Vec<HandlerRegistration>>,
}

impl HandlerRegistry {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    /// The handler of command `message_type`.
    #[must_use]
    pub fn command_handler(&self, message_type: &str) -> Option<&HandlerRegistration> {
        self.commands.get(message_type)
    }

    /// Listeners of event `message_type`, in registration order.
    #[must_use]
    pub fn listeners(&self, message_type: &str) -> &[HandlerRegistration] {
        self.listeners
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every routed namespace, sorted.
    #[must_use]
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self
            .commands
            .keys()
            .chain(self.listeners.keys())
            .copied()
            .collect();
        types.sort_unstable();
        types
    }

    /// Checks that every routed message can be decoded from the transport.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UndecodableMessageType` for the first
    /// namespace missing from `types`.
    pub fn ensure_decodable(&self, types: &MessageTypeRegistry) -> Result<(), ConfigurationError> {
        match self.message_types().into_iter().find(|ns| !types.contains(ns)) {
            Some(missing) => Err(ConfigurationError::UndecodableMessageType(missing.to_owned())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use servicebus_core::handler::MessageHandler;
    use servicebus_test_support::FailingHandler;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OpenAccount {
        owner: String,
    }

    impl MessageContract for OpenAccount {
        const MESSAGE_TYPE: &'static str = "bank.open_account";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AccountOpened {
        owner: String,
    }

    impl MessageContract for AccountOpened {
        const MESSAGE_TYPE: &'static str = "bank.account_opened";
        const KIND: MessageKind = MessageKind::Event;
    }

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(FailingHandler::new(|| {
            servicebus_core::error::DomainError::Handler("unused".to_owned())
        }))
    }

    fn open_account(name: &str) -> HandlerRegistration {
        HandlerRegistration::command::<OpenAccount, _, _>(name, |_, _| async { Ok(()) })
    }

    fn account_opened(name: &str) -> HandlerRegistration {
        HandlerRegistration::listener::<AccountOpened, _, _>(name, |_, _| async { Ok(()) })
    }

    #[test]
    fn test_build_resolves_commands_and_listeners() {
        // Arrange
        let builder = HandlerRegistry::builder()
            .register(open_account("accounts"))
            .register(account_opened("mailer"))
            .register(account_opened("ledger"))
            .require_command::<OpenAccount>();

        // Act
        let registry = builder.build().unwrap();

        // Assert
        assert_eq!(
            registry.command_handler(OpenAccount::MESSAGE_TYPE).unwrap().name,
            "accounts"
        );
        let names: Vec<_> = registry
            .listeners(AccountOpened::MESSAGE_TYPE)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["mailer", "ledger"]);
        assert!(registry.listeners("bank.unknown").is_empty());
    }

    #[test]
    fn test_required_command_without_handler_fails_at_build() {
        let result = HandlerRegistry::builder()
            .register(account_opened("mailer"))
            .require_command::<OpenAccount>()
            .build();

        assert_eq!(
            result.unwrap_err(),
            ConfigurationError::MissingCommandHandler("bank.open_account".to_owned())
        );
    }

    #[test]
    fn test_second_command_handler_is_ambiguous() {
        let result = HandlerRegistry::builder()
            .register(open_account("accounts"))
            .register(open_account("audit"))
            .build();

        assert_eq!(
            result.unwrap_err(),
            ConfigurationError::AmbiguousCommandHandler {
                message_type: "bank.open_account".to_owned(),
                count: 2,
            }
        );
    }

    #[test]
    fn test_role_contradicting_declared_kind_is_rejected() {
        let registration = HandlerRegistration::for_handler(
            AccountOpened::MESSAGE_TYPE,
            MessageKind::Event,
            MessageKind::Command,
            "confused",
            handler(),
        );

        let err = HandlerRegistry::builder()
            .register(registration)
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::KindMismatch { ref handler, .. } if handler == "confused"));
    }

    #[test]
    fn test_namespace_registered_with_both_roles_conflicts() {
        let as_command = HandlerRegistration::for_handler(
            "bank.shared",
            MessageKind::Command,
            MessageKind::Command,
            "a",
            handler(),
        );
        let as_event = HandlerRegistration::for_handler(
            "bank.shared",
            MessageKind::Event,
            MessageKind::Event,
            "b",
            handler(),
        );

        let err = HandlerRegistry::builder()
            .register_all([as_command, as_event])
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            ConfigurationError::ConflictingMessageKind("bank.shared".to_owned())
        );
    }

    #[test]
    fn test_ensure_decodable_reports_unregistered_types() {
        let registry = HandlerRegistry::builder()
            .register(open_account("accounts"))
            .register(account_opened("mailer"))
            .build()
            .unwrap();
        let mut types = MessageTypeRegistry::new();
        types.register::<OpenAccount>();

        let err = registry.ensure_decodable(&types).unwrap_err();
        types.register::<AccountOpened>();

        assert_eq!(
            err,
            ConfigurationError::UndecodableMessageType("bank.account_opened".to_owned())
        );
        assert!(registry.ensure_decodable(&types).is_ok());
    }
}
