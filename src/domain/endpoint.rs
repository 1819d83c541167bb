// src/domain/endpoint.rs

//! Declarative handler settings and the subscription endpoint built from them.

use std::any::TypeId;
use std::time::Duration;

use super::{SubscriptionDescription, SubscriptionFilter, TopicHandle};
use crate::naming::{self, MAX_SUBSCRIPTION_NAME_LEN};
use crate::{BusError, Result};

/// How received messages are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Messages are locked on receipt and must be completed, abandoned or
    /// dead-lettered explicitly.
    #[default]
    PeekLock,

    /// Messages are removed from the subscription as they are received.
    /// Handler failures lose the message.
    ReceiveAndDelete,
}

/// Per-handler-type subscription settings.
///
/// Returned by [`MessageHandler::settings`](crate::MessageHandler::settings);
/// this is how a handler type declares how it wants to be subscribed.
///
/// # Example
///
/// ```
/// use mom_pubsub::{DeliveryMode, HandlerSettings};
///
/// let settings = HandlerSettings::default()
///     .with_max_delivery_count(3)
///     .with_dead_letter_on_max_retries(true)
///     .with_max_concurrent_calls(4);
/// assert_eq!(settings.delivery_mode, DeliveryMode::PeekLock);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    // ---
    /// Peek-lock (default) or receive-and-delete.
    pub delivery_mode: DeliveryMode,

    /// Default message time-to-live on the subscription. `None` = unbounded.
    pub default_message_ttl: Option<Duration>,

    /// Peek-lock duration. Default: 60s.
    pub lock_duration: Duration,

    /// Delivery attempts before the message is given up. Default: 10.
    pub max_delivery_count: u32,

    /// Dead-letter (rather than drop) a message that exhausted its delivery
    /// attempts. Default: true.
    pub dead_letter_on_max_retries: bool,

    /// Dead-letter expired messages. Default: false.
    pub dead_letter_on_expiration: bool,

    /// Client-side prefetch. Default: 0.
    pub prefetch_count: u32,

    /// Reuse one handler instance for every message. The handler must then be
    /// safe for concurrent use. Default: false (fresh instance per message).
    pub singleton: bool,

    /// Share the subscription across all application instances. Default: false.
    pub competing: bool,

    /// Maximum messages dispatched concurrently for this subscription. Default: 1.
    pub max_concurrent_calls: u32,

    /// Allow broker-side batching. Default: true.
    pub enable_batched_operations: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        // ---
        Self {
            delivery_mode: DeliveryMode::PeekLock,
            default_message_ttl: None,
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            dead_letter_on_max_retries: true,
            dead_letter_on_expiration: false,
            prefetch_count: 0,
            singleton: false,
            competing: false,
            max_concurrent_calls: 1,
            enable_batched_operations: true,
        }
    }
}

impl HandlerSettings {
    /// Set the delivery mode.
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the default message time-to-live.
    pub fn with_default_message_ttl(mut self, ttl: Duration) -> Self {
        self.default_message_ttl = Some(ttl);
        self
    }

    /// Set the peek-lock duration.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    /// Set the maximum delivery count.
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    /// Choose dead-lettering (true) or dropping (false) after the last attempt.
    pub fn with_dead_letter_on_max_retries(mut self, enabled: bool) -> Self {
        self.dead_letter_on_max_retries = enabled;
        self
    }

    /// Dead-letter expired messages.
    pub fn with_dead_letter_on_expiration(mut self, enabled: bool) -> Self {
        self.dead_letter_on_expiration = enabled;
        self
    }

    /// Set the prefetch count.
    pub fn with_prefetch_count(mut self, count: u32) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Mark the handler reusable across messages.
    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Share the subscription between application instances.
    pub fn with_competing(mut self, competing: bool) -> Self {
        self.competing = competing;
        self
    }

    /// Set the per-subscription concurrency bound.
    pub fn with_max_concurrent_calls(mut self, calls: u32) -> Self {
        self.max_concurrent_calls = calls;
        self
    }

    /// Enable or disable broker-side batching.
    pub fn with_batched_operations(mut self, enabled: bool) -> Self {
        self.enable_batched_operations = enabled;
        self
    }

    /// Reject settings no broker would accept.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Configuration`] for a zero delivery count, zero
    /// concurrency, or a zero lock duration.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.max_delivery_count == 0 {
            return Err(BusError::Configuration(
                "max_delivery_count must be at least 1".into(),
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(BusError::Configuration(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.lock_duration.is_zero() {
            return Err(BusError::Configuration(
                "lock_duration must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to provision and consume one subscription.
///
/// Built once at registration; immutable afterwards.
#[derive(Debug, Clone)]
pub struct SubscriptionEndpoint {
    // ---
    /// Deterministic subscription name (≤ 50 characters).
    pub subscription_name: String,

    /// Payload type.
    pub message_type: TypeId,

    /// Normalized payload type name, used as the filter value.
    pub message_type_name: String,

    /// Handler type.
    pub handler_type: TypeId,

    /// Normalized handler type name.
    pub handler_type_name: String,

    /// Type filter applied on the subscription.
    pub filter: SubscriptionFilter,

    /// Declarative settings of the handler type.
    pub settings: HandlerSettings,
}

impl SubscriptionEndpoint {
    /// Build the endpoint for handler `H` consuming messages of type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Configuration`] when the settings are invalid or the
    /// derived name would exceed the broker's length limit.
    pub fn for_handler<M: 'static, H: 'static>(
        application_id: &str,
        settings: HandlerSettings,
    ) -> Result<Self> {
        // ---
        settings.validate()?;

        let message_type_name = naming::type_tag_of::<M>();
        let handler_type_name = naming::type_tag_of::<H>();

        let subscription_name = naming::subscription_name(
            application_id,
            settings.competing,
            &message_type_name,
            &handler_type_name,
        );

        if subscription_name.len() > MAX_SUBSCRIPTION_NAME_LEN {
            return Err(BusError::Configuration(format!(
                "subscription name {subscription_name} exceeds {MAX_SUBSCRIPTION_NAME_LEN} characters"
            )));
        }

        Ok(Self {
            subscription_name,
            filter: SubscriptionFilter::type_equals(message_type_name.clone()),
            message_type: TypeId::of::<M>(),
            message_type_name,
            handler_type: TypeId::of::<H>(),
            handler_type_name,
            settings,
        })
    }

    /// Filter expression applied to the subscription.
    pub fn filter_expression(&self) -> String {
        self.filter.expression()
    }

    /// Whether the subscription is shared between application instances.
    pub fn is_competing(&self) -> bool {
        self.settings.competing
    }

    /// Whether one handler instance serves every message.
    pub fn is_singleton_handler(&self) -> bool {
        self.settings.singleton
    }

    /// Broker-side description of this endpoint's subscription on `topic`.
    pub fn description(&self, topic: &TopicHandle) -> SubscriptionDescription {
        // ---
        SubscriptionDescription {
            topic_path: topic.path().to_string(),
            name: self.subscription_name.clone(),
            default_message_ttl: self.settings.default_message_ttl,
            lock_duration: self.settings.lock_duration,
            max_delivery_count: self.settings.max_delivery_count,
            dead_letter_on_expiration: self.settings.dead_letter_on_expiration,
            enable_batched_operations: self.settings.enable_batched_operations,
        }
    }
}
