//! Service bus builder.
//!
//! Provides a fluent builder API for configuring a bus over an application
//! supplied broker client.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::BrokerPtr;
use crate::handler::ComponentRegistry;
use crate::topic::TopicResolver;
use crate::{log_info, BusConfig, JsonSerializer, ReceiveStrategy, Result, RetryPolicy, Serializer, ServiceBus};

/// Builder for [`ServiceBus`] instances.
///
/// Starts from the [`BusConfig`] defaults with an empty
/// application id and topic; both must be set before [`build`](Self::build).
///
/// # Examples
///
/// ## Defaults
/// ```
/// use mom_pubsub::{create_memory_broker, ServiceBusBuilder};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let bus = ServiceBusBuilder::new(create_memory_broker())
///     .application_id("billing")
///     .topic("orders")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Push receive with a shared registry
/// ```
/// use mom_pubsub::{create_memory_broker, ComponentRegistry, ReceiveStrategy, ServiceBusBuilder};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let registry = Arc::new(ComponentRegistry::new());
///
/// let bus = ServiceBusBuilder::new(create_memory_broker())
///     .application_id("billing")
///     .topic("orders")
///     .receive_strategy(ReceiveStrategy::Push)
///     .send_timeout(Duration::from_secs(10))
///     .registry(registry)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBusBuilder<S: Serializer = JsonSerializer> {
    // ---
    broker: BrokerPtr,
    config: BusConfig,

    // Fresh registry unless the application shares one
    registry: Option<Arc<ComponentRegistry>>,

    _serializer: PhantomData<fn() -> S>,
}

impl ServiceBusBuilder<JsonSerializer> {
    /// Create a builder over `broker` with default settings and JSON payloads.
    pub fn new(broker: BrokerPtr) -> Self {
        // ---
        Self {
            broker,
            config: BusConfig::new("", ""),
            registry: None,
            _serializer: PhantomData,
        }
    }
}

impl<S: Serializer> ServiceBusBuilder<S> {
    /// Replace every setting with `config`.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the application id prefixed to exclusive subscription names.
    pub fn application_id(mut self, id: impl Into<String>) -> Self {
        self.config.application_id = id.into();
        self
    }

    /// Set the topic the bus publishes to and receives from.
    pub fn topic(mut self, name: impl Into<String>) -> Self {
        self.config.topic_name = name.into();
        self
    }

    /// Set the receive strategy.
    ///
    /// Default: [`ReceiveStrategy::Pull`].
    pub fn receive_strategy(mut self, strategy: ReceiveStrategy) -> Self {
        self.config.receive_strategy = strategy;
        self
    }

    /// Set how long a synchronous send waits for its result.
    ///
    /// Default: 60s.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Set the server wait of one receive.
    ///
    /// Default: 5s.
    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.config.receive_wait = wait;
        self
    }

    /// Set the retry policy for broker round-trips other than existence checks.
    pub fn standard_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.standard_policy = policy;
        self
    }

    /// Set the retry policy for existence checks.
    pub fn probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.probe_policy = policy;
        self
    }

    /// Share a component registry with the application.
    ///
    /// Handlers registered there before subscribing take precedence over the
    /// bus's default registrations.
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Switch the payload serializer.
    pub fn serializer<S2: Serializer>(self) -> ServiceBusBuilder<S2> {
        // ---
        ServiceBusBuilder {
            broker: self.broker,
            config: self.config,
            registry: self.registry,
            _serializer: PhantomData,
        }
    }

    /// Validate the settings, make sure the topic exists, and build the bus
    /// (consumes self).
    ///
    /// # Errors
    ///
    /// - [`BusError::Configuration`](crate::BusError::Configuration) for invalid settings
    /// - broker faults that are fatal or outlast the retry policies while
    ///   resolving the topic
    pub async fn build(self) -> Result<ServiceBus<S>> {
        // ---
        self.config.validate()?;

        let resolver = TopicResolver::new(
            self.broker.clone(),
            self.config.probe_policy.clone(),
            self.config.standard_policy.clone(),
        );
        let topic = resolver.ensure_topic(&self.config.topic_name).await?;

        log_info!(
            "bus {} ready on {} ({:?} receive)",
            self.config.application_id,
            topic.path(),
            self.config.receive_strategy
        );

        let registry = self.registry.unwrap_or_default();
        Ok(ServiceBus::new(self.config, self.broker, topic, registry))
    }
}
