//! Message serialization.
//!
//! On the wire a message is the envelope `{ "message": <fields>, "namespace":
//! <type> }`; the metadata map travels beside it and records the serializer
//! kind and the message type. Decoding goes through an explicit
//! [`MessageTypeRegistry`] built at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::message::{Message, MessageContract, MessageKind, denormalize};
use crate::metadata::{MESSAGE_TYPE, Metadata, SERIALIZER};
use crate::validation::MessageValidationFailed;

/// Transport-neutral message shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEnvelope {
    /// Normalized message fields.
    pub message: serde_json::Value,
    /// Message namespace.
    pub namespace: String,
}

/// Bytes ready for a transport, with their metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    /// Encoded envelope.
    pub payload: Vec<u8>,
    /// Metadata with serializer and message type recorded.
    pub metadata: Metadata,
}

/// A message rebuilt from a transport payload.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// The decoded message.
    pub message: Arc<dyn Message>,
    /// Metadata received with it.
    pub metadata: Metadata,
}

/// Converts messages to and from transport payloads.
pub trait MessageSerializer: Send + Sync {
    /// Kind recorded in the metadata (e.g. `"json"`).
    fn kind(&self) -> &'static str;

    /// Encodes a message.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the message cannot be encoded.
    fn encode(&self, message: &dyn Message, metadata: &Metadata)
    -> Result<EncodedMessage, DomainError>;

    /// Decodes a payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` for malformed payloads, foreign
    /// serializers and unknown namespaces.
    fn decode(&self, payload: &[u8], metadata: &Metadata) -> Result<DecodedMessage, DomainError>;
}

type Decoder = fn(serde_json::Value) -> Result<Arc<dyn Message>, DomainError>;

#[derive(Clone, Copy)]
struct RegisteredType {
    kind: MessageKind,
    decode: Decoder,
}

fn decode_as<M: MessageContract>(
    fields: serde_json::Value,
) -> Result<Arc<dyn Message>, DomainError> {
    Ok(Arc::new(denormalize::<M>(fields)?))
}

/// Namespace → decoder map.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    types: HashMap<&'static str, RegisteredType>,
}

impl MessageTypeRegistry {
    /// Creates a registry that already knows the kernel's own events.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register::<MessageValidationFailed>();
        registry
    }

    /// Registers `M` for decoding. Registering twice is harmless.
    pub fn register<M: MessageContract>(&mut self) -> &mut Self {
        self.types.insert(
            M::MESSAGE_TYPE,
            RegisteredType {
                kind: M::KIND,
                decode: decode_as::<M>,
            },
        );
        self
    }

    /// Returns `true` if `namespace` can be decoded.
    #[must_use]
    pub fn contains(&self, namespace: &str) -> bool {
        self.types.contains_key(namespace)
    }

    /// Kind declared for `namespace`.
    #[must_use]
    pub fn kind_of(&self, namespace: &str) -> Option<MessageKind> {
        self.types.get(namespace).map(|t| t.kind)
    }

    /// Registered namespaces, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Rebuilds the message registered under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` for unknown namespaces or fields
    /// that do not match the registered type.
    pub fn decode(
        &self,
        namespace: &str,
        fields: serde_json::Value,
    ) -> Result<Arc<dyn Message>, DomainError> {
        let registered = self.types.get(namespace).ok_or_else(|| {
            DomainError::Serialization(format!("unknown message type {namespace}"))
        })?;
        (registered.decode)(fields)
    }
}

impl fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("types", &self.namespaces())
            .finish()
    }
}

/// JSON serializer.
#[derive(Debug, Clone)]
pub struct JsonMessageSerializer {
    registry: Arc<MessageTypeRegistry>,
}

impl JsonMessageSerializer {
    /// Serializer kind written to the metadata.
    pub const KIND: &'static str = "json";

    /// Creates a serializer decoding through `registry`.
    #[must_use]
    pub fn new(registry: Arc<MessageTypeRegistry>) -> Self {
        Self { registry }
    }

    /// The registry used for decoding.
    #[must_use]
    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn encode(
        &self,
        message: &dyn Message,
        metadata: &Metadata,
    ) -> Result<EncodedMessage, DomainError> {
        let envelope = SerializedEnvelope {
            message: message.to_payload()?,
            namespace: message.message_type().to_owned(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        let metadata = metadata
            .with_reserved(SERIALIZER, Self::KIND)
            .with_reserved(MESSAGE_TYPE, message.message_type());
        Ok(EncodedMessage { payload, metadata })
    }

    fn decode(&self, payload: &[u8], metadata: &Metadata) -> Result<DecodedMessage, DomainError> {
        if let Some(kind) = metadata.serializer().filter(|k| *k != Self::KIND) {
            return Err(DomainError::Serialization(format!(
                "payload was produced by serializer {kind}, expected {}",
                Self::KIND
            )));
        }
        let envelope: SerializedEnvelope = serde_json::from_slice(payload)?;
        if let Some(declared) = metadata
            .message_type()
            .filter(|declared| *declared != envelope.namespace)
        {
            return Err(DomainError::Serialization(format!(
                "metadata declares {declared} but payload carries {}",
                envelope.namespace
            )));
        }
        let message = self.registry.decode(&envelope.namespace, envelope.message)?;
        let metadata = metadata.with_reserved(MESSAGE_TYPE, envelope.namespace);
        Ok(DecodedMessage { message, metadata })
    }
}
