// src/domain/message.rs

//! Inbound and outbound message types.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::naming::TYPE_TAG_PROPERTY;
use crate::MessageId;

/// Message properties (headers).
pub type Properties = HashMap<String, serde_json::Value>;

/// Opaque token identifying a peek-locked message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(pub Arc<str>);

impl LockToken {
    /// Generate a new unique lock token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }
}

/// A message handed out by the broker.
///
/// In peek-lock mode the message carries a lock token and must be finalized
/// (complete, abandon or dead-letter) exactly once.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    // ---
    /// Broker message id (the sender's [`MessageId`]).
    pub id: String,

    /// Number of times this message has been handed out, starting at 1.
    pub delivery_count: u32,

    /// Message properties, including the internal type tag.
    pub properties: Properties,

    /// Serialized payload.
    pub body: Bytes,

    /// Present in peek-lock mode only.
    pub lock_token: Option<LockToken>,
}

impl InboundMessage {
    /// The normalized type tag stamped by the sender, if any.
    pub fn type_tag(&self) -> Option<&str> {
        self.properties.get(TYPE_TAG_PROPERTY)?.as_str()
    }

    /// Application metadata: all properties except the internal type tag.
    pub fn application_properties(&self) -> Properties {
        // ---
        self.properties
            .iter()
            .filter(|(key, _)| key.as_str() != TYPE_TAG_PROPERTY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// A message ready to be published.
///
/// Built per send attempt from a freshly serialized body.
#[derive(Clone, Debug)]
pub struct OutboundEnvelope {
    // ---
    /// Message id, shared by all attempts of one send.
    pub id: MessageId,

    /// Normalized type name of the payload.
    pub type_tag: String,

    /// Caller metadata plus the type-tag property.
    pub properties: Properties,

    /// Serialized payload.
    pub body: Bytes,
}

impl OutboundEnvelope {
    /// Build an envelope, stamping the type-tag property over caller metadata.
    pub fn new(id: MessageId, type_tag: impl Into<String>, body: Bytes, metadata: &Properties) -> Self {
        // ---
        let type_tag = type_tag.into();
        let mut properties = metadata.clone();
        properties.insert(
            TYPE_TAG_PROPERTY.to_string(),
            serde_json::Value::String(type_tag.clone()),
        );

        Self {
            id,
            type_tag,
            properties,
            body,
        }
    }
}

/// A deserialized message handed to a [`MessageHandler`](crate::MessageHandler).
#[derive(Debug)]
pub struct ReceivedMessage<M> {
    // ---
    /// The deserialized payload.
    pub message: M,

    /// Application metadata sent alongside the payload (type tag excluded).
    pub metadata: Properties,

    /// The original broker message.
    pub inbound: InboundMessage,
}

impl<M> ReceivedMessage<M> {
    /// Broker message id.
    pub fn message_id(&self) -> &str {
        &self.inbound.id
    }

    /// How many times this message has been delivered, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.inbound.delivery_count
    }
}
