// src/domain/broker.rs

//! Broker client domain abstractions.
//!
//! This module defines the narrow interface through which the bus talks to a
//! topic/subscription broker. It intentionally avoids any reference to
//! concrete protocols, SDKs or connection handling.
//!
//! The broker is responsible for storing topics and subscriptions, routing
//! published envelopes to subscriptions whose filter matches, and handing out
//! peek-locked messages. Retries, fault classification, subscription
//! lifecycle and handler dispatch are handled elsewhere.
//!
//! The in-memory broker under `src/transport/` is the reference
//! implementation of these semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{DeliveryMode, InboundMessage, LockToken, OutboundEnvelope, Properties};
use crate::BrokerError;

/// Result type of broker client calls.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Dead-letter reason for messages whose delivery budget is exhausted.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Description of an existing topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicDescription {
    // ---
    /// Topic path, unique per broker namespace.
    pub path: String,
}

/// A resolved topic.
///
/// Created once per bus, immutable, cheap to clone and shared read-only by
/// the sender and the subscription manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicHandle {
    path: Arc<str>,
}

impl TopicHandle {
    /// Topic path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl From<TopicDescription> for TopicHandle {
    fn from(description: TopicDescription) -> Self {
        // ---
        Self {
            path: description.path.into(),
        }
    }
}

/// Equality filter on a single message property.
///
/// Rendered as `<property> = '<value>'`, the only filter form this crate
/// emits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionFilter {
    /// Property (header) name compared by the filter.
    pub property: String,
    /// Value the property must equal.
    pub value: String,
}

impl SubscriptionFilter {
    /// Filter matching messages whose type tag equals `type_tag`.
    pub fn type_equals(type_tag: impl Into<String>) -> Self {
        // ---
        Self {
            property: crate::naming::TYPE_TAG_PROPERTY.to_string(),
            value: type_tag.into(),
        }
    }

    /// Textual filter expression.
    pub fn expression(&self) -> String {
        format!("{} = '{}'", self.property, self.value)
    }

    /// Parse an expression of the form `<property> = '<value>'`.
    pub fn parse(expression: &str) -> Option<Self> {
        // ---
        let (property, value) = expression.split_once('=')?;
        let property = property.trim();
        let value = value.trim().strip_prefix('\'')?.strip_suffix('\'')?;

        if property.is_empty() {
            return None;
        }

        Some(Self {
            property: property.to_string(),
            value: value.to_string(),
        })
    }

    /// True when `properties` satisfy the filter.
    pub fn matches(&self, properties: &Properties) -> bool {
        // ---
        match properties.get(&self.property) {
            Some(serde_json::Value::String(value)) => *value == self.value,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Broker-side settings of a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDescription {
    // ---
    /// Owning topic path.
    pub topic_path: String,
    /// Subscription name (≤ 50 characters).
    pub name: String,
    /// Time-to-live applied to messages without their own; `None` = unbounded.
    pub default_message_ttl: Option<Duration>,
    /// How long a peek-lock holds before the message becomes visible again.
    pub lock_duration: Duration,
    /// Deliveries after which the broker itself dead-letters on abandon.
    pub max_delivery_count: u32,
    /// Move expired messages to the dead-letter sub-queue instead of dropping them.
    pub dead_letter_on_expiration: bool,
    /// Allow the broker to batch store operations.
    pub enable_batched_operations: bool,
}

/// A receiver attached to one subscription.
///
/// Returned by [`BrokerClient::create_subscription_client`] and passed back on
/// every receive and finalize call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionClientHandle {
    // ---
    /// Owning topic path.
    pub topic_path: Arc<str>,
    /// Subscription name.
    pub subscription_name: Arc<str>,
    /// Peek-lock or receive-and-delete.
    pub delivery_mode: DeliveryMode,
    /// Messages the client may buffer ahead of the caller (0 = none).
    pub prefetch_count: u32,
}

/// Options for a push-style message pump.
#[derive(Clone, Debug)]
pub struct PumpOptions {
    /// Upper bound on messages handed out and not yet consumed from the inbox.
    pub max_concurrent_calls: u32,
    /// Server wait used by the pump for each underlying receive.
    pub wait: Duration,
}

/// Event delivered by a push-style message pump.
#[derive(Debug)]
pub enum PumpEvent {
    /// A message was received.
    Message(InboundMessage),
    /// The pump hit a fault. It keeps running unless the fault is terminal
    /// (the subscription no longer exists).
    Error(BrokerError),
}

/// Handle returned from a successful [`BrokerClient::on_message`] registration.
///
/// Dropping the pump stops the broker from pushing further messages.
pub struct MessagePump {
    // ---
    /// Channel the broker pushes events into.
    pub inbox: mpsc::Receiver<PumpEvent>,
}

/// Broker client abstraction.
///
/// Implementations must ensure that:
/// - Once `create_subscription()` returns, messages sent to the topic that
///   match the subscription filter are stored for that subscription.
/// - A peek-locked message stays invisible to other receivers until it is
///   completed, abandoned, dead-lettered or its lock expires.
/// - Calls are safe to issue concurrently from many tasks.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat the methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    // ---
    /// Fetch a topic. Fails with [`BrokerError::NotFound`] when absent.
    async fn get_topic(&self, path: &str) -> BrokerResult<TopicDescription>;

    /// Create a topic. Fails with [`BrokerError::AlreadyExists`] when present.
    async fn create_topic(&self, path: &str) -> BrokerResult<TopicDescription>;

    /// Fetch a subscription. Fails with [`BrokerError::NotFound`] when absent.
    async fn get_subscription(
        &self,
        topic_path: &str,
        name: &str,
    ) -> BrokerResult<SubscriptionDescription>;

    /// Whether a subscription exists.
    ///
    /// Default implementation delegates to `get_subscription()`.
    async fn subscription_exists(&self, topic_path: &str, name: &str) -> BrokerResult<bool> {
        // ---
        match self.get_subscription(topic_path, name).await {
            Ok(_) => Ok(true),
            Err(BrokerError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create a filtered subscription. Fails with
    /// [`BrokerError::AlreadyExists`] when a subscription of that name exists.
    async fn create_subscription(
        &self,
        description: &SubscriptionDescription,
        filter: &SubscriptionFilter,
    ) -> BrokerResult<SubscriptionDescription>;

    /// Delete a subscription and everything stored for it.
    async fn delete_subscription(&self, topic_path: &str, name: &str) -> BrokerResult<()>;

    /// Attach a receiver to an existing subscription.
    ///
    /// Default implementation only builds the handle; brokers with real
    /// connections override it to open a link.
    async fn create_subscription_client(
        &self,
        description: &SubscriptionDescription,
        delivery_mode: DeliveryMode,
        prefetch_count: u32,
    ) -> BrokerResult<SubscriptionClientHandle> {
        // ---
        Ok(SubscriptionClientHandle {
            topic_path: description.topic_path.as_str().into(),
            subscription_name: description.name.as_str().into(),
            delivery_mode,
            prefetch_count,
        })
    }

    /// Receive one message, waiting at most `wait`. `Ok(None)` when nothing
    /// arrived in time.
    async fn receive(
        &self,
        client: &SubscriptionClientHandle,
        wait: Duration,
    ) -> BrokerResult<Option<InboundMessage>>;

    /// Register a push-style message pump for a subscription.
    async fn on_message(
        &self,
        client: &SubscriptionClientHandle,
        options: PumpOptions,
    ) -> BrokerResult<MessagePump>;

    /// Publish an envelope to a topic.
    async fn send(&self, topic: &TopicHandle, envelope: OutboundEnvelope) -> BrokerResult<()>;

    /// Remove a peek-locked message from the subscription.
    async fn complete(&self, client: &SubscriptionClientHandle, lock: &LockToken)
        -> BrokerResult<()>;

    /// Release a peek-locked message for immediate redelivery.
    async fn abandon(&self, client: &SubscriptionClientHandle, lock: &LockToken)
        -> BrokerResult<()>;

    /// Move a peek-locked message to the dead-letter sub-queue.
    async fn dead_letter(
        &self,
        client: &SubscriptionClientHandle,
        lock: &LockToken,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()>;

    /// Close the client and release any associated resources.
    async fn close(&self) -> BrokerResult<()>;
}

/// Shared broker client pointer.
///
/// This is an `Arc<dyn BrokerClient>`:
/// - `.clone()` is cheap (only increments a reference count)
/// - all clones share the same underlying connection
pub type BrokerPtr = Arc<dyn BrokerClient>;
