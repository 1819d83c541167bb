//! Subscription lifecycle management.
//!
//! The manager owns every live subscription of a bus. Creation and
//! cancellation are serialized per bus; lookups only take the registry lock.
//! Once closed, the manager refuses new subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::provisioner::SubscriptionProvisioner;
use super::receive_loop::{LoopOptions, ReceiveLoop};
use super::receiver::{ReceiverState, SubscriptionState};
use crate::domain::{BrokerPtr, SubscriptionEndpoint, TopicHandle};
use crate::handler::Dispatcher;
use crate::locks::lock_ignore_poison;
use crate::{log_debug, log_error, log_info, log_warn, BusConfig, BusError, Result};

enum Slot {
    Creating,
    Live(Arc<ReceiverState>),
}

pub(crate) struct SubscriptionManager {
    broker: BrokerPtr,
    provisioner: Arc<SubscriptionProvisioner>,
    loop_options: LoopOptions,
    cancel_poll_attempts: u32,
    cancel_poll_interval: Duration,
    registry: Mutex<HashMap<String, Slot>>,
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SubscriptionManager {
    pub(crate) fn new(broker: BrokerPtr, topic: TopicHandle, config: &BusConfig) -> Self {
        // ---
        let provisioner = SubscriptionProvisioner::new(
            broker.clone(),
            topic,
            config.probe_policy.clone(),
            config.standard_policy.clone(),
        );

        Self {
            broker,
            provisioner: Arc::new(provisioner),
            loop_options: LoopOptions::from(config),
            cancel_poll_attempts: config.cancel_poll_attempts,
            cancel_poll_interval: config.cancel_poll_interval,
            registry: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Provision the endpoint's subscription and start its receive loop.
    ///
    /// Returns `false` when the subscription is already live on this bus.
    ///
    /// # Errors
    ///
    /// - [`BusError::ShutDown`] once the manager is closed
    /// - fatal broker faults and faults that outlast the retry policy; the
    ///   subscription is left absent in that case
    pub(crate) async fn create_subscription(
        &self,
        endpoint: SubscriptionEndpoint,
        dispatcher: Dispatcher,
    ) -> Result<bool> {
        // ---
        let _lifecycle = self.lifecycle.lock().await;
        let name = endpoint.subscription_name.clone();

        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        if self.state_of(&name) != SubscriptionState::Absent {
            log_debug!("subscription {name} is already live");
            return Ok(false);
        }
        lock_ignore_poison(&self.registry).insert(name.clone(), Slot::Creating);

        let attached = async {
            let description = self.provisioner.ensure(&endpoint).await?;
            self.provisioner.attach(&endpoint, &description).await
        }
        .await;

        let client = match attached {
            Ok(client) => client,
            Err(err) => {
                lock_ignore_poison(&self.registry).remove(&name);
                return Err(err);
            }
        };

        let receiver = Arc::new(ReceiverState::new(endpoint, client));
        lock_ignore_poison(&self.registry).insert(name.clone(), Slot::Live(receiver.clone()));

        let _task = ReceiveLoop::new(
            self.broker.clone(),
            self.provisioner.clone(),
            receiver,
            dispatcher,
            self.loop_options.clone(),
        )
        .spawn();

        log_info!("subscription {name} is active");
        Ok(true)
    }

    /// Stop the endpoint's receive loop and delete its broker-side
    /// subscription. A no-op when the subscription is not live.
    ///
    /// Waits at most `cancel_poll_attempts × cancel_poll_interval` for the
    /// loop to unwind, then at most as long again for the broker-side
    /// deletion. A deletion still running after that continues in the
    /// background. Failures are logged; cancellation itself always succeeds.
    pub(crate) async fn cancel_subscription(&self, endpoint: &SubscriptionEndpoint) {
        // ---
        let _lifecycle = self.lifecycle.lock().await;
        self.cancel_locked(&endpoint.subscription_name).await
    }

    /// Refuse further subscriptions and cancel every live one.
    ///
    /// A creation already in progress finishes first and is cancelled with
    /// the rest.
    pub(crate) async fn close(&self) {
        // ---
        let _lifecycle = self.lifecycle.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        for name in self.active_subscriptions() {
            self.cancel_locked(&name).await;
        }
    }

    // Caller holds `lifecycle`
    async fn cancel_locked(&self, name: &str) {
        // ---
        let receiver = match lock_ignore_poison(&self.registry).get(name) {
            Some(Slot::Live(receiver)) => receiver.clone(),
            _ => return,
        };

        receiver.request_cancel();

        let mut polls = 0;
        while !receiver.is_loop_completed() && polls < self.cancel_poll_attempts {
            tokio::time::sleep(self.cancel_poll_interval).await;
            polls += 1;
        }

        if !receiver.is_loop_completed() {
            log_warn!("{name}: receive loop did not stop in time, deleting the subscription anyway");
        }

        let provisioner = self.provisioner.clone();
        let owned_name = name.to_string();
        let deletion = tokio::spawn(async move { provisioner.delete(&owned_name).await });

        let bound = self.cancel_poll_interval.saturating_mul(self.cancel_poll_attempts.max(1));
        match tokio::time::timeout(bound, deletion).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => log_warn!("{name}: deleting the subscription failed: {err}"),
            Ok(Err(join_err)) => log_error!("{name}: deletion task failed: {join_err}"),
            Err(_) => log_warn!("{name}: deletion still running after {bound:?}, continuing in background"),
        }

        receiver.set_state(SubscriptionState::Deleted);
        lock_ignore_poison(&self.registry).remove(name);
        log_info!("subscription {name} cancelled");
    }

    /// Lifecycle state of a subscription on this bus.
    pub(crate) fn state_of(&self, name: &str) -> SubscriptionState {
        // ---
        match lock_ignore_poison(&self.registry).get(name) {
            None => SubscriptionState::Absent,
            Some(Slot::Creating) => SubscriptionState::Creating,
            Some(Slot::Live(receiver)) => receiver.state(),
        }
    }

    /// Names of the live subscriptions, sorted.
    pub(crate) fn active_subscriptions(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = lock_ignore_poison(&self.registry)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
