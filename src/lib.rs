//! Publish/subscribe over a topic/subscription message broker with typed
//! handlers and managed, fault-tolerant receive loops.
//!
//! Every message type a handler consumes gets its own filtered subscription
//! on one shared topic. The bus provisions topics and subscriptions on demand,
//! keeps one receive loop per subscription running through broker faults,
//! settles each message according to the handler's outcome, and retries
//! transient faults on every broker round-trip.
//!
//! The broker is reached through the [`BrokerClient`] trait. An in-memory
//! implementation, [`MemoryBroker`], ships with the crate for tests and local
//! development.

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod domain;
mod handler;
mod subscription;
mod transport;

mod bus;
mod bus_builder;
mod bus_config;
mod receive_strategy;

mod error;
mod locks;
mod message_id;
mod naming;
mod retry;
mod sender;
mod serializer;
mod topic;

// Re-export main types
pub use bus::ServiceBus;
pub use bus_builder::ServiceBusBuilder;

pub use bus_config::BusConfig;
pub use receive_strategy::ReceiveStrategy;

pub use error::{BrokerError, BusError, HandlerError, Result};
pub use message_id::MessageId;
pub use retry::{is_transient, is_transient_probe, RetryPolicy};
pub use sender::SendResult;
pub use serializer::{JsonSerializer, Serializer};
pub use subscription::SubscriptionState;
pub use topic::TopicResolver;

pub use handler::{ComponentRegistry, Lifetime, MessageHandler};

pub use naming::{
    //
    normalize_type_name,
    subscription_name,
    type_tag_of,
    COMPETING_PREFIX,
    MAX_APPLICATION_ID_LEN,
    MAX_SUBSCRIPTION_NAME_LEN,
    TYPE_TAG_PROPERTY,
};

pub use transport::{
    //
    create_memory_broker,
    BrokerOperation,
    DeadLetteredMessage,
    MemoryBroker,
    TTL_EXPIRED,
};

// --- public re-exports
pub use domain::{
    //
    BrokerClient,
    BrokerPtr,
    BrokerResult,
    DeliveryMode,
    HandlerSettings,
    InboundMessage,
    LockToken,
    MessagePump,
    OutboundEnvelope,
    Properties,
    PumpEvent,
    PumpOptions,
    ReceivedMessage,
    SubscriptionClientHandle,
    SubscriptionDescription,
    SubscriptionEndpoint,
    SubscriptionFilter,
    TopicDescription,
    TopicHandle,
    MAX_DELIVERY_COUNT_EXCEEDED,
};
