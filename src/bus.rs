//! Service bus facade.
//!
//! A [`ServiceBus`] ties one topic on one broker to a set of typed handler
//! subscriptions and a typed sender. Build it with
//! [`ServiceBusBuilder`](crate::ServiceBusBuilder).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{BrokerPtr, Properties, SubscriptionEndpoint, TopicHandle};
use crate::handler::{wrap_handler, ComponentRegistry, Lifetime, MessageHandler};
use crate::sender::{SendResult, Sender};
use crate::subscription::{SubscriptionManager, SubscriptionState};
use crate::{log_info, BusConfig, BusError, JsonSerializer, MessageId, Result, Serializer};

/// Publish/subscribe bus over one topic.
///
/// Cheap to clone; all clones share the same subscriptions.
///
/// # Example
///
/// ```
/// use mom_pubsub::{
///     create_memory_broker, BusConfig, HandlerError, MessageHandler, ReceivedMessage,
///     ServiceBusBuilder,
/// };
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
///     async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> Result<(), HandlerError> {
///         println!("billing order {}", msg.message.order_id);
///         Ok(())
///     }
/// }
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let bus = ServiceBusBuilder::new(create_memory_broker())
///     .config(BusConfig::new("billing", "orders"))
///     .build()
///     .await?;
///
/// bus.subscribe::<OrderPlaced, Billing>().await?;
/// bus.send(OrderPlaced { order_id: 7 }).await?;
///
/// bus.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBus<S: Serializer = JsonSerializer> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Serializer> {
    config: Arc<BusConfig>,
    topic: TopicHandle,
    registry: Arc<ComponentRegistry>,
    subscriptions: SubscriptionManager,
    sender: Sender<S>,
    shut_down: AtomicBool,
}

impl<S: Serializer> ServiceBus<S> {
    /// Create a bus over an already resolved topic (internal use by
    /// `ServiceBusBuilder`).
    pub(crate) fn new(
        config: BusConfig,
        broker: BrokerPtr,
        topic: TopicHandle,
        registry: Arc<ComponentRegistry>,
    ) -> Self {
        // ---
        let subscriptions = SubscriptionManager::new(broker.clone(), topic.clone(), &config);
        let sender = Sender::new(
            broker,
            topic.clone(),
            config.standard_policy.clone(),
            config.send_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                topic,
                registry,
                subscriptions,
                sender,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe handler `H` to messages of type `M`.
    ///
    /// Registers `H` with the component registry unless the application
    /// registered it already: as a singleton when
    /// [`HandlerSettings::singleton`](crate::HandlerSettings::singleton) is set,
    /// otherwise built afresh per message.
    ///
    /// Returns `false` when the subscription was already live. Subscribing
    /// the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BusError::Configuration`] for invalid handler settings
    /// - broker faults that are fatal or outlast the retry policies
    /// - [`BusError::ShutDown`] after [`shutdown`](Self::shutdown)
    pub async fn subscribe<M, H>(&self) -> Result<bool>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M> + Default,
    {
        // ---
        let lifetime = if H::settings().singleton {
            Lifetime::Singleton
        } else {
            Lifetime::PerResolve
        };
        self.inner.registry.register_if_absent(lifetime, H::default);

        self.subscribe_registered::<M, H>().await
    }

    /// Subscribe a handler the application registered in the component
    /// registry itself, typically because it needs constructor arguments.
    ///
    /// # Errors
    ///
    /// As [`subscribe`](Self::subscribe), plus [`BusError::Configuration`]
    /// when `H` is not registered.
    pub async fn subscribe_registered<M, H>(&self) -> Result<bool>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        // ---
        self.ensure_running()?;

        if !self.inner.registry.is_registered::<H>() {
            return Err(BusError::Configuration(format!(
                "handler {} is not registered",
                std::any::type_name::<H>()
            )));
        }

        let endpoint = self.endpoint::<M, H>()?;
        let dispatcher =
            wrap_handler::<M, H, S>(self.inner.registry.clone(), endpoint.message_type_name.clone());

        self.inner
            .subscriptions
            .create_subscription(endpoint, dispatcher)
            .await
    }

    /// Cancel the subscription of handler `H` for `M` and delete it on the
    /// broker. A no-op when it is not live.
    ///
    /// Returns within the configured cancellation bound; broker-side deletion
    /// failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// [`BusError::Configuration`] when the handler's settings are invalid.
    pub async fn unsubscribe<M, H>(&self) -> Result<()>
    where
        M: Send + 'static,
        H: MessageHandler<M>,
    {
        // ---
        let endpoint = self.endpoint::<M, H>()?;
        self.inner.subscriptions.cancel_subscription(&endpoint).await;
        Ok(())
    }

    /// Whether handler `H` currently receives messages of type `M`.
    pub fn is_subscribed<M, H>(&self) -> bool
    where
        M: Send + 'static,
        H: MessageHandler<M>,
    {
        self.subscription_state::<M, H>() == SubscriptionState::Active
    }

    /// Lifecycle state of the subscription of handler `H` for `M`.
    pub fn subscription_state<M, H>(&self) -> SubscriptionState
    where
        M: Send + 'static,
        H: MessageHandler<M>,
    {
        // ---
        match self.endpoint::<M, H>() {
            Ok(endpoint) => self.inner.subscriptions.state_of(&endpoint.subscription_name),
            Err(_) => SubscriptionState::Absent,
        }
    }

    /// Names of the live subscriptions of this bus, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.active_subscriptions()
    }

    /// Publish `message` and wait for the result.
    ///
    /// # Errors
    ///
    /// - [`BusError::Timeout`] if no terminal result arrived within the send timeout
    /// - [`BusError::ShutDown`] after [`shutdown`](Self::shutdown)
    /// - the error that ended the send otherwise
    pub async fn send<M>(&self, message: M) -> Result<MessageId>
    where
        M: Serialize + Send + Sync + 'static,
    {
        self.send_with_metadata(message, Properties::new()).await
    }

    /// Publish `message` with application metadata and wait for the result.
    ///
    /// The metadata travels as message properties and is handed to handlers
    /// as [`ReceivedMessage::metadata`](crate::ReceivedMessage::metadata).
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn send_with_metadata<M>(&self, message: M, metadata: Properties) -> Result<MessageId>
    where
        M: Serialize + Send + Sync + 'static,
    {
        // ---
        self.ensure_running()?;
        self.inner.sender.send(message, metadata).await
    }

    /// Publish `message` without waiting.
    ///
    /// `callback` runs exactly once with a [`SendResult`] carrying `state`,
    /// on success, failure and timeout alike.
    ///
    /// # Errors
    ///
    /// [`BusError::ShutDown`] after [`shutdown`](Self::shutdown); the callback
    /// is not invoked in that case.
    pub fn send_async<M, St, F>(
        &self,
        message: M,
        state: St,
        callback: F,
        metadata: Properties,
    ) -> Result<MessageId>
    where
        M: Serialize + Send + Sync + 'static,
        St: Send + 'static,
        F: FnOnce(SendResult<St>) + Send + 'static,
    {
        // ---
        self.ensure_running()?;
        Ok(self.inner.sender.send_async(message, state, callback, metadata))
    }

    /// The component registry handlers are resolved from.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.inner.registry
    }

    /// The topic this bus publishes to and receives from.
    pub fn topic(&self) -> &TopicHandle {
        &self.inner.topic
    }

    /// The configuration this bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Cancel every subscription and refuse further sends and subscriptions.
    ///
    /// The broker client is left open; it may be shared with other buses.
    pub async fn shutdown(&self) {
        // ---
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.subscriptions.close().await;
        log_info!(
            "bus {} on {} shut down",
            self.inner.config.application_id,
            self.inner.topic.path()
        );
    }

    fn endpoint<M: Send + 'static, H: MessageHandler<M>>(&self) -> Result<SubscriptionEndpoint> {
        SubscriptionEndpoint::for_handler::<M, H>(&self.inner.config.application_id, H::settings())
    }

    fn ensure_running(&self) -> Result<()> {
        // ---
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        Ok(())
    }
}

impl<S: Serializer> Clone for ServiceBus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
