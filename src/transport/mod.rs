//! Broker client implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `BrokerClient` trait. Domain code must not depend on broker-specific types.

mod memory;

pub use memory::{
    // ---
    create_memory_broker,
    BrokerOperation,
    DeadLetteredMessage,
    MemoryBroker,
    TTL_EXPIRED,
};
