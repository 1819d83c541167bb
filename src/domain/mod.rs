//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! concrete brokers, SDKs, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod endpoint;
mod message;

// --- Broker domain re-exports ---

pub use broker::{
    //
    BrokerClient,
    BrokerPtr,
    BrokerResult,
    MessagePump,
    PumpEvent,
    PumpOptions,
    SubscriptionClientHandle,
    SubscriptionDescription,
    SubscriptionFilter,
    TopicDescription,
    TopicHandle,
    MAX_DELIVERY_COUNT_EXCEEDED,
};

// --- Endpoint and message re-exports ---

pub use endpoint::{
    //
    DeliveryMode,
    HandlerSettings,
    SubscriptionEndpoint,
};

pub use message::{
    //
    InboundMessage,
    LockToken,
    OutboundEnvelope,
    Properties,
    ReceivedMessage,
};
