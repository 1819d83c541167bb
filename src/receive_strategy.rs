//! Receive strategy enumeration.
//!
//! Defines how a subscription's receive loop obtains messages from the broker.

/// How a receive loop obtains messages.
///
/// Both strategies follow the same dispatch and settlement rules; they only
/// differ in who drives the receive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveStrategy {
    /// The loop itself issues a receive with a server wait timeout, dispatches
    /// what arrives, and immediately issues the next receive.
    #[default]
    Pull,

    /// The loop installs one message pump per attachment and the broker pushes
    /// messages into it, bounded by the handler's concurrency level.
    Push,
}
