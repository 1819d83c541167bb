//! Subscription receive loop.
//!
//! This module drives one subscription: it obtains messages from the broker,
//! dispatches them to the subscription's handler, and settles each message
//! according to the handler's outcome.
//!
//! ## Strategies
//!
//! - **Pull**: the loop issues a receive with a server wait timeout, hands any
//!   message to a dispatch task, and immediately issues the next receive.
//! - **Push**: the loop installs a broker message pump once per attachment and
//!   consumes its inbox.
//!
//! Both strategies share the same dispatch and settlement rules.
//!
//! ## Dispatch contract
//!
//! 1. A message that arrives after cancellation was requested is not
//!    processed. In peek-lock mode it is abandoned so it returns to the
//!    broker unprocessed.
//! 2. The body is deserialized into the declared message type and wrapped
//!    together with the broker message and its application metadata.
//! 3. The handler is resolved from the component registry and invoked.
//!    Handler errors and panics are caught at this boundary.
//! 4. In peek-lock mode: success completes; a failure below the delivery
//!    budget abandons; a failure at the budget dead-letters or completes,
//!    as declared by the handler. Settlement faults are logged and dropped,
//!    the broker redelivers the message once its lock expires.
//! 5. A subscription deleted out-of-band is recreated and re-attached.
//! 6. Any other fault pauses the loop briefly before receiving again.
//!
//! The loop only terminates through cancellation. It waits for in-flight
//! dispatches to finish before reporting completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::provisioner::SubscriptionProvisioner;
use super::receiver::ReceiverState;
use crate::domain::{
    // ---
    BrokerPtr,
    InboundMessage,
    LockToken,
    MessagePump,
    PumpEvent,
    PumpOptions,
    MAX_DELIVERY_COUNT_EXCEEDED,
};
use crate::handler::{DispatchOutcome, Dispatcher};
use crate::retry::is_transient;
use crate::{log_debug, log_info, log_warn, BrokerError, BusConfig, BusError, ReceiveStrategy, RetryPolicy};

/// Timing and retry settings of a receive loop.
#[derive(Debug, Clone)]
pub(crate) struct LoopOptions {
    pub(crate) strategy: ReceiveStrategy,
    pub(crate) receive_wait: Duration,
    pub(crate) error_restart_delay: Duration,
    pub(crate) standard_policy: RetryPolicy,
}

impl From<&BusConfig> for LoopOptions {
    fn from(config: &BusConfig) -> Self {
        // ---
        Self {
            strategy: config.receive_strategy,
            receive_wait: config.receive_wait,
            error_restart_delay: config.error_restart_delay,
            standard_policy: config.standard_policy.clone(),
        }
    }
}

pub(crate) struct ReceiveLoop {
    broker: BrokerPtr,
    provisioner: Arc<SubscriptionProvisioner>,
    receiver: Arc<ReceiverState>,
    dispatcher: Dispatcher,
    options: LoopOptions,
}

impl ReceiveLoop {
    pub(crate) fn new(
        broker: BrokerPtr,
        provisioner: Arc<SubscriptionProvisioner>,
        receiver: Arc<ReceiverState>,
        dispatcher: Dispatcher,
        options: LoopOptions,
    ) -> Self {
        // ---
        Self {
            broker,
            provisioner,
            receiver,
            dispatcher,
            options,
        }
    }

    /// Start the loop on its own task.
    ///
    /// The returned handle completes after cancellation once every in-flight
    /// dispatch has been settled.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run())
    }

    async fn run(self: Arc<Self>) {
        // ---
        let max_calls = self.receiver.endpoint.settings.max_concurrent_calls.max(1);
        let permits = Arc::new(Semaphore::new(max_calls as usize));

        log_info!(
            "receive loop started for {} ({:?}, {} concurrent)",
            self.name(),
            self.options.strategy,
            max_calls
        );

        match self.options.strategy {
            ReceiveStrategy::Pull => self.run_pull(&permits).await,
            ReceiveStrategy::Push => self.run_push(&permits).await,
        }

        // Wait for in-flight dispatches
        let _drained = permits.acquire_many(max_calls).await;

        self.receiver.mark_loop_completed();
        log_info!("receive loop stopped for {}", self.name());
    }

    async fn run_pull(self: &Arc<Self>, permits: &Arc<Semaphore>) {
        // ---
        loop {
            let Some(permit) = self.acquire(permits).await else {
                return;
            };

            // An in-flight receive is not preempted; it returns within the
            // server wait and a late message is abandoned by `accept`.
            match self.receive_once().await {
                Ok(Some(message)) => self.accept(message, permit).await,
                Ok(None) => {}
                Err(err) => {
                    drop(permit);
                    if !self.recover(err).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_push(self: &Arc<Self>, permits: &Arc<Semaphore>) {
        // ---
        loop {
            if self.receiver.is_cancel_requested() {
                return;
            }

            let pump = match self.register_pump().await {
                Ok(pump) => pump,
                Err(err) => {
                    if !self.recover(err).await {
                        return;
                    }
                    continue;
                }
            };

            let Some(fault) = self.consume_pump(pump, permits).await else {
                return;
            };

            if !self.recover(fault).await {
                return;
            }
        }
    }

    /// Consume a pump until cancellation (returns `None`) or a fault that
    /// requires re-attaching (returns the fault).
    async fn consume_pump(self: &Arc<Self>, mut pump: MessagePump, permits: &Arc<Semaphore>) -> Option<BusError> {
        // ---
        let cancel = self.receiver.cancellation().clone();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = pump.inbox.recv() => Some(event),
            };

            let Some(event) = event else {
                self.drain_pump(pump).await;
                return None;
            };

            match event {
                Some(PumpEvent::Message(message)) => {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        self.release(message).await;
                        return None;
                    };
                    self.accept(message, permit).await;
                }
                Some(PumpEvent::Error(err)) => {
                    self.drain_pump(pump).await;
                    return Some(err.into());
                }
                None => {
                    return Some(BrokerError::Communication("message pump stopped".into()).into());
                }
            }
        }
    }

    /// Stop a pump and hand back whatever it already buffered.
    async fn drain_pump(&self, mut pump: MessagePump) {
        // ---
        pump.inbox.close();
        while let Some(event) = pump.inbox.recv().await {
            if let PumpEvent::Message(message) = event {
                self.release(message).await;
            }
        }
    }

    async fn register_pump(&self) -> crate::Result<MessagePump> {
        // ---
        let client = &self.receiver.client();
        let options = &PumpOptions {
            max_concurrent_calls: self.receiver.endpoint.settings.max_concurrent_calls,
            wait: self.options.receive_wait,
        };

        self.options
            .standard_policy
            .execute(
                || async move {
                    self.broker
                        .on_message(client, options.clone())
                        .await
                        .map_err(BusError::from)
                },
                is_transient,
            )
            .await
    }

    async fn receive_once(&self) -> crate::Result<Option<InboundMessage>> {
        // ---
        let client = &self.receiver.client();
        self.options
            .standard_policy
            .execute(
                || async move {
                    self.broker
                        .receive(client, self.options.receive_wait)
                        .await
                        .map_err(BusError::from)
                },
                is_transient,
            )
            .await
    }

    /// Wait for a free dispatch slot, or `None` once cancellation is requested.
    async fn acquire(&self, permits: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        // ---
        let cancel = self.receiver.cancellation();
        if cancel.is_cancelled() {
            return None;
        }

        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = permits.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Dispatch a received message, unless cancellation was requested.
    async fn accept(self: &Arc<Self>, message: InboundMessage, permit: OwnedSemaphorePermit) {
        // ---
        if self.receiver.is_cancel_requested() {
            log_debug!(
                "{}: returning message {} received after cancellation",
                self.name(),
                message.id
            );
            self.release(message).await;
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            // ---
            let _permit = permit;
            let id = message.id.clone();
            let lock = message.lock_token.clone();
            let delivery_count = message.delivery_count;

            let outcome = (this.dispatcher)(message).await;
            this.settle(&id, lock, delivery_count, outcome).await;
        });
    }

    /// Map a dispatch outcome to complete, abandon or dead-letter.
    async fn settle(&self, id: &str, lock: Option<LockToken>, delivery_count: u32, outcome: DispatchOutcome) {
        // ---
        let name = self.name();
        let settings = &self.receiver.endpoint.settings;
        let client = &self.receiver.client();

        let Some(lock) = lock else {
            if let DispatchOutcome::Failed(reason) = outcome {
                log_warn!("{name}: message {id} failed and cannot be redelivered: {reason}");
            }
            return;
        };

        let settled = match outcome {
            DispatchOutcome::Handled => self.broker.complete(client, &lock).await,
            DispatchOutcome::Failed(reason) if delivery_count < settings.max_delivery_count => {
                log_debug!(
                    "{name}: message {id} failed on delivery {delivery_count}/{}: {reason}",
                    settings.max_delivery_count
                );
                self.broker.abandon(client, &lock).await
            }
            DispatchOutcome::Failed(reason) if settings.dead_letter_on_max_retries => {
                log_warn!("{name}: dead-lettering message {id} after {delivery_count} deliveries: {reason}");
                self.broker
                    .dead_letter(client, &lock, MAX_DELIVERY_COUNT_EXCEEDED, &reason)
                    .await
            }
            DispatchOutcome::Failed(reason) => {
                log_warn!("{name}: dropping message {id} after {delivery_count} deliveries: {reason}");
                self.broker.complete(client, &lock).await
            }
        };

        if let Err(err) = settled {
            log_warn!("{name}: settling message {id} failed, it will be redelivered: {err}");
        }
    }

    /// Return a message to the broker unprocessed.
    async fn release(&self, message: InboundMessage) {
        // ---
        let Some(lock) = message.lock_token else {
            return;
        };

        if let Err(err) = self.broker.abandon(&self.receiver.client(), &lock).await {
            log_debug!("{}: abandoning message {} failed: {err}", self.name(), message.id);
        }
    }

    /// Handle a receive fault. Returns `false` when the loop should stop.
    async fn recover(&self, err: BusError) -> bool {
        // ---
        if self.receiver.is_cancel_requested() {
            return false;
        }

        if err.is_not_found() {
            log_warn!("{}: subscription is gone on the broker, recreating it", self.name());
            return self.recreate().await;
        }

        log_warn!(
            "{}: receive failed, restarting in {:?}: {err}",
            self.name(),
            self.options.error_restart_delay
        );
        self.pause().await
    }

    /// Provision the subscription again and re-attach the receiver.
    async fn recreate(&self) -> bool {
        // ---
        loop {
            if self.receiver.is_cancel_requested() {
                return false;
            }

            let attached = async {
                let endpoint = &self.receiver.endpoint;
                let description = self.provisioner.ensure(endpoint).await?;
                self.provisioner.attach(endpoint, &description).await
            }
            .await;

            match attached {
                Ok(client) => {
                    self.receiver.replace_client(client);
                    if self.receiver.is_cancel_requested() {
                        self.discard_recreated().await;
                        return false;
                    }
                    log_info!("{}: subscription recreated", self.name());
                    return true;
                }
                Err(err) => {
                    log_warn!("{}: recreating subscription failed: {err}", self.name());
                    if !self.pause().await {
                        return false;
                    }
                }
            }
        }
    }

    /// Delete a subscription provisioned after cancellation was requested.
    async fn discard_recreated(&self) {
        // ---
        log_info!("{}: cancelled while recreating, deleting the subscription", self.name());
        if let Err(err) = self.provisioner.delete(self.name()).await {
            log_warn!("{}: deleting the recreated subscription failed: {err}", self.name());
        }
    }

    /// Sleep for the restart delay. Returns `false` if cancelled meanwhile.
    async fn pause(&self) -> bool {
        // ---
        tokio::select! {
            _ = self.receiver.cancellation().cancelled() => false,
            _ = tokio::time::sleep(self.options.error_restart_delay) => true,
        }
    }

    fn name(&self) -> &str {
        self.receiver.subscription_name()
    }
}
