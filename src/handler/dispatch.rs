//! Typed handler trait and type-erased dispatch.
//!
//! Handlers implement [`MessageHandler<M>`] for the payload type they consume.
//! At registration the bus turns the `(M, H, S)` triple into a [`Dispatcher`],
//! a type-erased closure the receive loop calls per message without knowing
//! any of the three types.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::ComponentRegistry;
use crate::domain::{HandlerSettings, InboundMessage, ReceivedMessage};
use crate::{HandlerError, Serializer};

/// A handler for messages of type `M`.
///
/// The associated [`settings`](MessageHandler::settings) function is the
/// handler type's declarative subscription configuration.
///
/// # Example
///
/// ```
/// use mom_pubsub::{HandlerError, HandlerSettings, MessageHandler, ReceivedMessage};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { order_id: u64 }
///
/// #[derive(Default)]
/// struct Billing;
///
/// #[async_trait::async_trait]
/// impl MessageHandler<OrderPlaced> for Billing {
///     fn settings() -> HandlerSettings {
///         HandlerSettings::default().with_max_delivery_count(5)
///     }
///
///     async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> Result<(), HandlerError> {
///         println!("billing order {}", msg.message.order_id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync + 'static {
    /// Subscription settings for this handler type.
    fn settings() -> HandlerSettings
    where
        Self: Sized,
    {
        HandlerSettings::default()
    }

    /// Handle one message. An error abandons or dead-letters the message
    /// according to the handler's settings.
    async fn handle(&self, message: ReceivedMessage<M>) -> Result<(), HandlerError>;
}

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// The handler returned `Ok`.
    Handled,
    /// Deserialization, resolution or the handler failed.
    Failed(String),
}

pub(crate) type DispatchFuture = Pin<Box<dyn Future<Output = DispatchOutcome> + Send>>;

/// Type-erased dispatch function.
///
/// Wrapped in Arc for cheap cloning when spawning tasks.
pub(crate) type Dispatcher = Arc<dyn Fn(InboundMessage) -> DispatchFuture + Send + Sync>;

/// Wrap a typed handler into a type-erased dispatcher.
///
/// The dispatcher deserializes with a fresh `S`, resolves `H` from the
/// registry, and runs the handler on its own task so that a panic is reported
/// as a failure instead of unwinding through the receive loop.
pub(crate) fn wrap_handler<M, H, S>(registry: Arc<ComponentRegistry>, expected_tag: String) -> Dispatcher
where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
    S: Serializer,
{
    // ---
    Arc::new(move |inbound: InboundMessage| {
        let registry = registry.clone();
        let expected_tag = expected_tag.clone();

        let fut = Box::pin(async move {
            // ---
            if inbound.type_tag() != Some(expected_tag.as_str()) {
                return DispatchOutcome::Failed(format!(
                    "unexpected message type {:?}, expected {expected_tag}",
                    inbound.type_tag()
                ));
            }

            let message: M = match S::default().deserialize(&inbound.body) {
                Ok(message) => message,
                Err(err) => return DispatchOutcome::Failed(err.to_string()),
            };

            let Some(handler) = registry.resolve::<H>() else {
                return DispatchOutcome::Failed(format!(
                    "handler {} is not registered",
                    std::any::type_name::<H>()
                ));
            };

            let received = ReceivedMessage {
                message,
                metadata: inbound.application_properties(),
                inbound,
            };

            let joined = tokio::spawn(async move {
                handler.handle(received).await.map_err(|err| err.to_string())
            })
            .await;

            match joined {
                Ok(Ok(())) => DispatchOutcome::Handled,
                Ok(Err(reason)) => DispatchOutcome::Failed(reason),
                Err(join_err) => DispatchOutcome::Failed(format!("handler panicked: {join_err}")),
            }
        });

        fut as DispatchFuture
    })
}
