//! Message publishing.
//!
//! Every send serializes its payload afresh on each attempt, stamps the
//! message id and the normalized type tag over the caller's metadata, and
//! publishes under the standard retry policy.
//!
//! [`Sender::send_async`] never blocks: the publish runs on its own task and
//! the caller's callback receives exactly one [`SendResult`], whether the send
//! succeeded, failed, or ran out of time. [`Sender::send`] waits for that
//! result.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::{BrokerPtr, OutboundEnvelope, Properties, TopicHandle};
use crate::naming::type_tag_of;
use crate::retry::is_transient;
use crate::{log_debug, log_warn, BusError, MessageId, Result, RetryPolicy, Serializer};

/// Terminal result of one send, handed to the `send_async` callback.
#[derive(Debug)]
pub struct SendResult<St> {
    // ---
    /// Id of the message that was (or failed to be) published.
    pub message_id: MessageId,

    /// Whether the message reached the broker.
    pub success: bool,

    /// Time from the call until the terminal result.
    pub elapsed: Duration,

    /// Opaque caller state passed to `send_async`.
    pub state: St,

    /// Why the send failed, if it did.
    pub error: Option<BusError>,
}

struct SenderInner {
    broker: BrokerPtr,
    topic: TopicHandle,
    policy: RetryPolicy,
    send_timeout: Duration,
}

/// Publishes typed messages to the bus topic.
pub(crate) struct Sender<S> {
    inner: Arc<SenderInner>,
    _serializer: PhantomData<fn() -> S>,
}

impl<S> Clone for Sender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _serializer: PhantomData,
        }
    }
}

impl<S: Serializer> Sender<S> {
    pub(crate) fn new(broker: BrokerPtr, topic: TopicHandle, policy: RetryPolicy, send_timeout: Duration) -> Self {
        // ---
        Self {
            inner: Arc::new(SenderInner {
                broker,
                topic,
                policy,
                send_timeout,
            }),
            _serializer: PhantomData,
        }
    }

    /// Publish `message` and wait for the result.
    ///
    /// # Errors
    ///
    /// - [`BusError::Timeout`] if no terminal result arrived within the send timeout
    /// - the error that ended the send otherwise
    pub(crate) async fn send<M>(&self, message: M, metadata: Properties) -> Result<MessageId>
    where
        M: Serialize + Send + Sync + 'static,
    {
        // ---
        let (tx, rx) = oneshot::channel();
        let id = self.send_async(
            message,
            (),
            move |result: SendResult<()>| {
                let _ = tx.send(result);
            },
            metadata,
        );

        match tokio::time::timeout(self.inner.send_timeout, rx).await {
            Ok(Ok(result)) => match result.error {
                None => Ok(id),
                Some(err) => Err(err),
            },
            Ok(Err(_)) => Err(BusError::ShutDown),
            Err(_) => Err(BusError::Timeout(self.inner.send_timeout)),
        }
    }

    /// Publish `message` in the background.
    ///
    /// `callback` runs exactly once with the terminal result and `state`.
    /// Returns the id stamped on the message.
    pub(crate) fn send_async<M, St, F>(&self, message: M, state: St, callback: F, metadata: Properties) -> MessageId
    where
        M: Serialize + Send + Sync + 'static,
        St: Send + 'static,
        F: FnOnce(SendResult<St>) + Send + 'static,
    {
        // ---
        let id = MessageId::generate();
        let inner = self.inner.clone();
        let message_id = id.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            // ---
            let published = tokio::time::timeout(
                inner.send_timeout,
                publish::<S, M>(&inner, &message_id, &message, &metadata),
            )
            .await;

            let outcome = match published {
                Ok(outcome) => outcome,
                Err(_) => Err(BusError::Timeout(inner.send_timeout)),
            };

            match &outcome {
                Ok(()) => log_debug!("published {message_id} to {}", inner.topic.path()),
                Err(err) => log_warn!("send of {message_id} to {} failed: {err}", inner.topic.path()),
            }

            callback(SendResult {
                message_id,
                success: outcome.is_ok(),
                elapsed: started.elapsed(),
                state,
                error: outcome.err(),
            });
        });

        id
    }
}

async fn publish<S, M>(inner: &SenderInner, id: &MessageId, message: &M, metadata: &Properties) -> Result<()>
where
    S: Serializer,
    M: Serialize,
{
    // ---
    let type_tag = &type_tag_of::<M>();

    inner
        .policy
        .execute(
            || {
                // A retried attempt never reuses a previous attempt's body
                let mut serializer = S::default();
                let envelope = serializer.serialize(message).map(|body| {
                    log_debug!("serialized {id} as {} ({} bytes)", serializer.content_type(), body.len());
                    OutboundEnvelope::new(id.clone(), type_tag.clone(), body, metadata)
                });

                async move {
                    match envelope {
                        Ok(envelope) => inner
                            .broker
                            .send(&inner.topic, envelope)
                            .await
                            .map_err(BusError::from),
                        Err(err) => Err(err),
                    }
                }
            },
            is_transient,
        )
        .await
}
