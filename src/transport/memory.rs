//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `BrokerClient` trait. It is intended primarily for testing, local execution,
//! and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** the bus is written
//! against:
//!
//! - Once `create_subscription()` returns, messages sent to the topic whose
//!   properties satisfy the subscription filter are stored for it.
//! - Peek-lock receives hand out a lock token and hide the message until it is
//!   completed, abandoned, dead-lettered or the lock expires.
//! - Every hand-out increments the message's delivery count.
//! - An abandon that reaches the subscription's max delivery count moves the
//!   message to the dead-letter sub-queue.
//! - Deleting a subscription drops everything stored for it; pending receives
//!   and push pumps observe [`BrokerError::NotFound`].
//!
//! ## Fault Injection
//!
//! [`MemoryBroker::fail_next`] queues errors returned by the next calls of a
//! given [`BrokerOperation`], which lets tests drive the retry classifiers,
//! creation races and receive-loop restarts deterministically.
//! [`MemoryBroker::delay_next`] holds the next call of an operation for a
//! while, standing in for a slow broker.
//!
//! ## Non-Goals
//!
//! Persistence, sessions, duplicate detection and network behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::domain::{
    // ---
    BrokerClient,
    BrokerPtr,
    BrokerResult,
    DeliveryMode,
    InboundMessage,
    LockToken,
    MessagePump,
    OutboundEnvelope,
    Properties,
    PumpEvent,
    PumpOptions,
    SubscriptionClientHandle,
    SubscriptionDescription,
    SubscriptionFilter,
    TopicDescription,
    TopicHandle,
    MAX_DELIVERY_COUNT_EXCEEDED,
};
use crate::locks::lock_ignore_poison;
use crate::{log_debug, log_info, BrokerError};

/// Dead-letter reason used for expired messages.
pub const TTL_EXPIRED: &str = "TTLExpiredException";

// Pause between pump receives after a transient fault.
const PUMP_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Broker operations that can be counted and fault-injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    // ---
    GetTopic,
    CreateTopic,
    GetSubscription,
    CreateSubscription,
    DeleteSubscription,
    CreateSubscriptionClient,
    Receive,
    Send,
    Complete,
    Abandon,
    DeadLetter,
}

/// A message that ended up in a dead-letter sub-queue.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    // ---
    /// Message id.
    pub id: String,
    /// Message properties.
    pub properties: Properties,
    /// Payload.
    pub body: Bytes,
    /// Delivery count at the time of dead-lettering.
    pub delivery_count: u32,
    /// Dead-letter reason.
    pub reason: String,
    /// Dead-letter description.
    pub description: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    properties: Properties,
    body: Bytes,
    delivery_count: u32,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn to_inbound(&self, lock_token: Option<LockToken>) -> InboundMessage {
        // ---
        InboundMessage {
            id: self.id.clone(),
            delivery_count: self.delivery_count,
            properties: self.properties.clone(),
            body: self.body.clone(),
            lock_token,
        }
    }

    fn into_dead_letter(self, reason: &str, description: &str) -> DeadLetteredMessage {
        // ---
        DeadLetteredMessage {
            id: self.id,
            properties: self.properties,
            body: self.body,
            delivery_count: self.delivery_count,
            reason: reason.to_string(),
            description: description.to_string(),
        }
    }
}

struct LockedMessage {
    message: StoredMessage,
    locked_until: Instant,
}

struct SubscriptionState {
    description: SubscriptionDescription,
    filter: SubscriptionFilter,
    queue: VecDeque<StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    dead_letters: Vec<DeadLetteredMessage>,
    notify: Arc<Notify>,
}

impl SubscriptionState {
    fn new(description: SubscriptionDescription, filter: SubscriptionFilter) -> Self {
        // ---
        Self {
            description,
            filter,
            queue: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Return expired locks to the queue and drop or dead-letter expired messages.
    fn reap(&mut self, now: Instant) {
        // ---
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.release(locked.message);
            }
        }

        let dead_letter_on_expiration = self.description.dead_letter_on_expiration;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for message in self.queue.drain(..) {
            match message.expires_at {
                Some(at) if at <= now => {
                    if dead_letter_on_expiration {
                        self.dead_letters
                            .push(message.into_dead_letter(TTL_EXPIRED, "message time-to-live expired"));
                    }
                }
                _ => kept.push_back(message),
            }
        }
        self.queue = kept;
    }

    /// Make a previously handed-out message visible again, or dead-letter it
    /// when its delivery budget is spent.
    fn release(&mut self, message: StoredMessage) {
        // ---
        if message.delivery_count >= self.description.max_delivery_count {
            self.dead_letters.push(message.into_dead_letter(
                MAX_DELIVERY_COUNT_EXCEEDED,
                "message could not be consumed after max delivery attempts",
            ));
        } else {
            self.queue.push_front(message);
            self.notify.notify_one();
        }
    }

    fn take_next(&mut self, mode: DeliveryMode, now: Instant) -> Option<InboundMessage> {
        // ---
        let mut message = self.queue.pop_front()?;
        message.delivery_count += 1;

        match mode {
            DeliveryMode::ReceiveAndDelete => Some(message.to_inbound(None)),
            DeliveryMode::PeekLock => {
                let token = LockToken::generate();
                let inbound = message.to_inbound(Some(token.clone()));
                self.locked.insert(
                    token,
                    LockedMessage {
                        message,
                        locked_until: now + self.description.lock_duration,
                    },
                );
                Some(inbound)
            }
        }
    }

    fn take_locked(&mut self, token: &LockToken, now: Instant) -> BrokerResult<StoredMessage> {
        // ---
        self.reap(now);
        self.locked
            .remove(token)
            .map(|locked| locked.message)
            .ok_or_else(|| BrokerError::LockLost(format!("lock {} is not held", token.0)))
    }
}

#[derive(Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, TopicState>,
}

impl HubState {
    fn subscription_mut(&mut self, topic_path: &str, name: &str) -> BrokerResult<&mut SubscriptionState> {
        // ---
        self.topics
            .get_mut(topic_path)
            .ok_or_else(|| BrokerError::NotFound(topic_path.to_string()))?
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(entity_path(topic_path, name)))
    }
}

fn entity_path(topic_path: &str, name: &str) -> String {
    format!("{topic_path}/subscriptions/{name}")
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    faults: Mutex<HashMap<BrokerOperation, VecDeque<BrokerError>>>,
    delays: Mutex<HashMap<BrokerOperation, VecDeque<Duration>>>,
    calls: Mutex<HashMap<BrokerOperation, u64>>,
    closed: AtomicBool,
}

impl Hub {
    /// Count the call, sit out an injected delay and return an injected
    /// fault, if one is queued.
    async fn enter(&self, op: BrokerOperation) -> BrokerResult<()> {
        // ---
        *lock_ignore_poison(&self.calls).entry(op).or_insert(0) += 1;

        let delay = lock_ignore_poison(&self.delays)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            log_debug!("memory broker: delaying {op:?} by {delay:?}");
            tokio::time::sleep(delay).await;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let injected = lock_ignore_poison(&self.faults)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);

        match injected {
            Some(err) => {
                log_debug!("memory broker: injected {op:?} fault: {err}");
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn receive(
        &self,
        client: &SubscriptionClientHandle,
        wait: Duration,
    ) -> BrokerResult<Option<InboundMessage>> {
        // ---
        self.enter(BrokerOperation::Receive).await?;
        let deadline = Instant::now() + wait;

        loop {
            let notify = {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(BrokerError::Closed);
                }

                let now = Instant::now();
                let mut state = lock_ignore_poison(&self.state);
                let sub = state.subscription_mut(&client.topic_path, &client.subscription_name)?;
                sub.reap(now);

                if let Some(message) = sub.take_next(client.delivery_mode, now) {
                    return Ok(Some(message));
                }
                sub.notify.clone()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    async fn settle<F>(
        &self,
        op: BrokerOperation,
        client: &SubscriptionClientHandle,
        token: &LockToken,
        settle: F,
    ) -> BrokerResult<()>
    where
        F: FnOnce(&mut SubscriptionState, StoredMessage),
    {
        // ---
        self.enter(op).await?;

        if client.delivery_mode != DeliveryMode::PeekLock {
            return Err(BrokerError::PeerFault(
                "settlement requires a peek-lock receiver".into(),
            ));
        }

        let mut state = lock_ignore_poison(&self.state);
        let sub = state.subscription_mut(&client.topic_path, &client.subscription_name)?;
        let message = sub.take_locked(token, Instant::now())?;
        settle(sub, message);
        Ok(())
    }
}

/// In-memory broker.
///
/// Cheap to share: wrap it in an `Arc` and hand clones to every bus that
/// should see the same topics, exactly as processes connected to one broker
/// namespace would.
pub struct MemoryBroker {
    // ---
    hub: Arc<Hub>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            hub: Arc::new(Hub::default()),
        })
    }

    /// Queue `err` to be returned by the next call of `op`.
    ///
    /// Calling this several times queues several faults, consumed in order.
    pub fn fail_next(&self, op: BrokerOperation, err: BrokerError) {
        // ---
        lock_ignore_poison(&self.hub.faults)
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Hold the next call of `op` for `delay` before serving it.
    ///
    /// Delays queue up like faults; a delayed call can still fail with an
    /// injected fault afterwards.
    pub fn delay_next(&self, op: BrokerOperation, delay: Duration) {
        // ---
        lock_ignore_poison(&self.hub.delays)
            .entry(op)
            .or_default()
            .push_back(delay);
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn call_count(&self, op: BrokerOperation) -> u64 {
        lock_ignore_poison(&self.hub.calls)
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a topic exists.
    pub fn topic_exists(&self, topic_path: &str) -> bool {
        lock_ignore_poison(&self.hub.state)
            .topics
            .contains_key(topic_path)
    }

    /// Names of the subscriptions on a topic, sorted.
    pub fn subscription_names(&self, topic_path: &str) -> Vec<String> {
        // ---
        let state = lock_ignore_poison(&self.hub.state);
        let mut names: Vec<String> = state
            .topics
            .get(topic_path)
            .map(|topic| topic.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Messages stored for a subscription: queued plus currently locked.
    pub fn active_message_count(&self, topic_path: &str, name: &str) -> usize {
        // ---
        let mut state = lock_ignore_poison(&self.hub.state);
        match state.subscription_mut(topic_path, name) {
            Ok(sub) => sub.queue.len() + sub.locked.len(),
            Err(_) => 0,
        }
    }

    /// Contents of a subscription's dead-letter sub-queue.
    pub fn dead_letters(&self, topic_path: &str, name: &str) -> Vec<DeadLetteredMessage> {
        // ---
        let mut state = lock_ignore_poison(&self.hub.state);
        match state.subscription_mut(topic_path, name) {
            Ok(sub) => sub.dead_letters.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for MemoryBroker {
    // ---

    async fn get_topic(&self, path: &str) -> BrokerResult<TopicDescription> {
        // ---
        self.hub.enter(BrokerOperation::GetTopic).await?;

        let state = lock_ignore_poison(&self.hub.state);
        if state.topics.contains_key(path) {
            Ok(TopicDescription {
                path: path.to_string(),
            })
        } else {
            Err(BrokerError::NotFound(path.to_string()))
        }
    }

    async fn create_topic(&self, path: &str) -> BrokerResult<TopicDescription> {
        // ---
        self.hub.enter(BrokerOperation::CreateTopic).await?;

        let mut state = lock_ignore_poison(&self.hub.state);
        if state.topics.contains_key(path) {
            return Err(BrokerError::AlreadyExists(path.to_string()));
        }
        state.topics.insert(path.to_string(), TopicState::default());
        log_info!("memory broker: created topic {path}");

        Ok(TopicDescription {
            path: path.to_string(),
        })
    }

    async fn get_subscription(
        &self,
        topic_path: &str,
        name: &str,
    ) -> BrokerResult<SubscriptionDescription> {
        // ---
        self.hub.enter(BrokerOperation::GetSubscription).await?;

        let mut state = lock_ignore_poison(&self.hub.state);
        Ok(state.subscription_mut(topic_path, name)?.description.clone())
    }

    async fn create_subscription(
        &self,
        description: &SubscriptionDescription,
        filter: &SubscriptionFilter,
    ) -> BrokerResult<SubscriptionDescription> {
        // ---
        self.hub.enter(BrokerOperation::CreateSubscription).await?;

        let mut state = lock_ignore_poison(&self.hub.state);
        let topic = state
            .topics
            .get_mut(&description.topic_path)
            .ok_or_else(|| BrokerError::NotFound(description.topic_path.clone()))?;

        if topic.subscriptions.contains_key(&description.name) {
            return Err(BrokerError::AlreadyExists(entity_path(
                &description.topic_path,
                &description.name,
            )));
        }

        topic.subscriptions.insert(
            description.name.clone(),
            SubscriptionState::new(description.clone(), filter.clone()),
        );
        log_info!(
            "memory broker: created subscription {} with filter {filter}",
            entity_path(&description.topic_path, &description.name)
        );

        Ok(description.clone())
    }

    async fn delete_subscription(&self, topic_path: &str, name: &str) -> BrokerResult<()> {
        // ---
        self.hub.enter(BrokerOperation::DeleteSubscription).await?;

        let removed = {
            let mut state = lock_ignore_poison(&self.hub.state);
            state
                .topics
                .get_mut(topic_path)
                .and_then(|topic| topic.subscriptions.remove(name))
        };

        match removed {
            Some(sub) => {
                log_info!("memory broker: deleted subscription {}", entity_path(topic_path, name));
                // Wake pending receivers so they observe the deletion
                sub.notify.notify_waiters();
                Ok(())
            }
            None => Err(BrokerError::NotFound(entity_path(topic_path, name))),
        }
    }

    async fn create_subscription_client(
        &self,
        description: &SubscriptionDescription,
        delivery_mode: DeliveryMode,
        prefetch_count: u32,
    ) -> BrokerResult<SubscriptionClientHandle> {
        // ---
        self.hub.enter(BrokerOperation::CreateSubscriptionClient).await?;

        Ok(SubscriptionClientHandle {
            topic_path: description.topic_path.as_str().into(),
            subscription_name: description.name.as_str().into(),
            delivery_mode,
            prefetch_count,
        })
    }

    async fn receive(
        &self,
        client: &SubscriptionClientHandle,
        wait: Duration,
    ) -> BrokerResult<Option<InboundMessage>> {
        self.hub.receive(client, wait).await
    }

    /// Spawn a pump task that receives on behalf of the caller and pushes
    /// into a channel bounded by `max_concurrent_calls`.
    ///
    /// The pump stops when the returned [`MessagePump`] is dropped, when the
    /// broker closes, or after reporting that the subscription is gone.
    async fn on_message(
        &self,
        client: &SubscriptionClientHandle,
        options: PumpOptions,
    ) -> BrokerResult<MessagePump> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.hub.state);
            state.subscription_mut(&client.topic_path, &client.subscription_name)?;
        }

        let capacity = options.max_concurrent_calls.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let hub = self.hub.clone();
        let client = client.clone();

        tokio::spawn(async move {
            // ---
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = hub.receive(&client, options.wait) => received,
                };

                match received {
                    Ok(Some(message)) => {
                        if let Err(mpsc::error::SendError(PumpEvent::Message(message))) =
                            tx.send(PumpEvent::Message(message)).await
                        {
                            // Nobody is listening any more; hand the message back.
                            if let Some(token) = message.lock_token {
                                let _ = hub
                                    .settle(BrokerOperation::Abandon, &client, &token, |sub, stored| {
                                        sub.release(stored)
                                    })
                                    .await;
                            }
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        let terminal = matches!(err, BrokerError::NotFound(_) | BrokerError::Closed);
                        if tx.send(PumpEvent::Error(err)).await.is_err() || terminal {
                            break;
                        }
                        tokio::time::sleep(PUMP_ERROR_BACKOFF).await;
                    }
                }
            }
            log_debug!("memory broker: pump stopped for {}", client.subscription_name);
        });

        Ok(MessagePump { inbox: rx })
    }

    async fn send(&self, topic: &TopicHandle, envelope: OutboundEnvelope) -> BrokerResult<()> {
        // ---
        self.hub.enter(BrokerOperation::Send).await?;

        let now = Instant::now();
        let mut state = lock_ignore_poison(&self.hub.state);
        let topic_state = state
            .topics
            .get_mut(topic.path())
            .ok_or_else(|| BrokerError::NotFound(topic.path().to_string()))?;

        for (name, sub) in topic_state.subscriptions.iter_mut() {
            if !sub.filter.matches(&envelope.properties) {
                continue;
            }
            log_debug!("memory broker: {} -> {name}", envelope.id);

            sub.queue.push_back(StoredMessage {
                id: envelope.id.to_string(),
                properties: envelope.properties.clone(),
                body: envelope.body.clone(),
                delivery_count: 0,
                expires_at: sub.description.default_message_ttl.map(|ttl| now + ttl),
            });
            sub.notify.notify_one();
        }

        Ok(())
    }

    async fn complete(&self, client: &SubscriptionClientHandle, lock: &LockToken) -> BrokerResult<()> {
        self.hub
            .settle(BrokerOperation::Complete, client, lock, |_, _| {})
            .await
    }

    async fn abandon(&self, client: &SubscriptionClientHandle, lock: &LockToken) -> BrokerResult<()> {
        self.hub
            .settle(BrokerOperation::Abandon, client, lock, |sub, message| sub.release(message))
            .await
    }

    async fn dead_letter(
        &self,
        client: &SubscriptionClientHandle,
        lock: &LockToken,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        // ---
        self.hub
            .settle(BrokerOperation::DeadLetter, client, lock, |sub, message| {
                sub.dead_letters.push(message.into_dead_letter(reason, description))
            })
            .await
    }

    /// Close the broker.
    ///
    /// Every later call fails with [`BrokerError::Closed`]; pending receives
    /// return on their next wake-up.
    async fn close(&self) -> BrokerResult<()> {
        // ---
        self.hub.closed.store(true, Ordering::SeqCst);

        let state = lock_ignore_poison(&self.hub.state);
        for topic in state.topics.values() {
            for sub in topic.subscriptions.values() {
                sub.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

/// Process-global broker used by [`create_memory_broker`].
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

/// Return the process-global in-memory broker.
///
/// Every call returns a handle to the same broker, matching the semantics of
/// clients connected to one broker namespace. For isolated tests construct a
/// private one with [`MemoryBroker::new`].
pub fn create_memory_broker() -> BrokerPtr {
    // ---
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}
