//! Message handlers: the typed handler trait, type-erased dispatch, and the
//! component registry handlers are resolved from.

mod dispatch;
mod registry;

pub use dispatch::MessageHandler;
pub use registry::{ComponentRegistry, Lifetime};

pub(crate) use dispatch::{wrap_handler, DispatchOutcome, Dispatcher};
