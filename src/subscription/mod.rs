//! Subscription lifecycle and receive loops.
//!
//! - `provisioner`: idempotent broker-side create, attach and delete
//! - `receiver`: state shared by a subscription's manager and its loop
//! - `receive_loop`: pull and push receive loops with handler dispatch
//! - `manager`: create/cancel orchestration and the live-subscription registry

mod manager;
mod provisioner;
mod receive_loop;
mod receiver;

pub use receiver::SubscriptionState;

pub(crate) use manager::SubscriptionManager;
