//! Broker-side subscription provisioning.
//!
//! Creating a subscription is idempotent: an existing subscription is reused,
//! and losing a creation race to another process or task falls back to
//! fetching the winner's subscription. Deleting tolerates the subscription
//! having vanished already.

use crate::domain::{
    // ---
    BrokerPtr,
    SubscriptionClientHandle,
    SubscriptionDescription,
    SubscriptionEndpoint,
    TopicHandle,
};
use crate::retry::{is_transient, is_transient_probe};
use crate::{log_debug, log_info, BusError, Result, RetryPolicy};

pub(crate) struct SubscriptionProvisioner {
    broker: BrokerPtr,
    topic: TopicHandle,
    probe_policy: RetryPolicy,
    standard_policy: RetryPolicy,
}

impl SubscriptionProvisioner {
    pub(crate) fn new(
        broker: BrokerPtr,
        topic: TopicHandle,
        probe_policy: RetryPolicy,
        standard_policy: RetryPolicy,
    ) -> Self {
        // ---
        Self {
            broker,
            topic,
            probe_policy,
            standard_policy,
        }
    }

    /// Make sure the endpoint's subscription exists on the broker.
    pub(crate) async fn ensure(&self, endpoint: &SubscriptionEndpoint) -> Result<SubscriptionDescription> {
        // ---
        let name = endpoint.subscription_name.as_str();

        match self.get(name).await {
            Ok(description) => return Ok(description),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let description = &endpoint.description(&self.topic);
        let created = self
            .standard_policy
            .execute(
                || async move {
                    self.broker
                        .create_subscription(description, &endpoint.filter)
                        .await
                        .map_err(BusError::from)
                },
                is_transient,
            )
            .await;

        match created {
            Ok(description) => {
                log_info!(
                    "created subscription {name} on {} with filter {}",
                    self.topic.path(),
                    endpoint.filter
                );
                Ok(description)
            }
            Err(err) if err.is_already_exists() => {
                log_debug!("subscription {name} was created concurrently, fetching it");
                self.get(name).await
            }
            Err(err) => Err(err),
        }
    }

    /// Attach a receiver with the endpoint's delivery mode and prefetch count.
    pub(crate) async fn attach(
        &self,
        endpoint: &SubscriptionEndpoint,
        description: &SubscriptionDescription,
    ) -> Result<SubscriptionClientHandle> {
        // ---
        let settings = &endpoint.settings;
        self.standard_policy
            .execute(
                || async move {
                    self.broker
                        .create_subscription_client(
                            description,
                            settings.delivery_mode,
                            settings.prefetch_count,
                        )
                        .await
                        .map_err(BusError::from)
                },
                is_transient,
            )
            .await
    }

    /// Delete a subscription. A subscription that is already gone counts as
    /// deleted.
    pub(crate) async fn delete(&self, name: &str) -> Result<()> {
        // ---
        let deleted = self
            .standard_policy
            .execute(
                || async move {
                    self.broker
                        .delete_subscription(self.topic.path(), name)
                        .await
                        .map_err(BusError::from)
                },
                is_transient,
            )
            .await;

        match deleted {
            Ok(()) => {
                log_info!("deleted subscription {name}");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                log_debug!("subscription {name} was already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get(&self, name: &str) -> Result<SubscriptionDescription> {
        // ---
        self.probe_policy
            .execute(
                || async move {
                    self.broker
                        .get_subscription(self.topic.path(), name)
                        .await
                        .map_err(BusError::from)
                },
                is_transient_probe,
            )
            .await
    }
}
