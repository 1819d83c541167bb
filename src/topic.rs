//! Topic resolution.
//!
//! [`TopicResolver::ensure_topic`] makes sure a topic exists before senders
//! and receivers attach to it. Several processes may race to create the same
//! topic; the loser of the race picks up the winner's topic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::domain::{BrokerPtr, TopicHandle};
use crate::locks::lock_ignore_poison;
use crate::retry::{is_transient, is_transient_probe};
use crate::{log_debug, log_info, BusError, Result, RetryPolicy};

/// Resolves and caches topic handles.
pub struct TopicResolver {
    broker: BrokerPtr,
    probe_policy: RetryPolicy,
    standard_policy: RetryPolicy,
    resolved: Mutex<HashMap<String, Arc<OnceCell<TopicHandle>>>>,
}

impl TopicResolver {
    /// Create a resolver issuing its calls through `broker`.
    pub fn new(broker: BrokerPtr, probe_policy: RetryPolicy, standard_policy: RetryPolicy) -> Self {
        // ---
        Self {
            broker,
            probe_policy,
            standard_policy,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure topic `name` exists and return its handle.
    ///
    /// Concurrent callers for the same name share one resolution; once it
    /// succeeds the handle is cached for the lifetime of the resolver. A
    /// failed resolution is not cached.
    ///
    /// # Errors
    ///
    /// - [`BusError::Configuration`] for an empty name
    /// - broker faults that are fatal or outlast the retry policies
    pub async fn ensure_topic(&self, name: &str) -> Result<TopicHandle> {
        // ---
        if name.trim().is_empty() {
            return Err(BusError::Configuration("topic name must not be empty".into()));
        }

        let cell = lock_ignore_poison(&self.resolved)
            .entry(name.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| self.resolve(name)).await.cloned()
    }

    async fn resolve(&self, name: &str) -> Result<TopicHandle> {
        // ---
        match self.get_topic(name).await {
            Ok(handle) => return Ok(handle),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let created = self
            .standard_policy
            .execute(
                || async move { self.broker.create_topic(name).await.map_err(BusError::from) },
                is_transient,
            )
            .await;

        match created {
            Ok(description) => {
                log_info!("created topic {name}");
                Ok(TopicHandle::from(description))
            }
            Err(err) if err.is_already_exists() => {
                log_debug!("topic {name} was created concurrently, fetching it");
                self.get_topic(name).await
            }
            Err(err) => Err(err),
        }
    }

    async fn get_topic(&self, name: &str) -> Result<TopicHandle> {
        // ---
        let description = self
            .probe_policy
            .execute(
                || async move { self.broker.get_topic(name).await.map_err(BusError::from) },
                is_transient_probe,
            )
            .await?;
        Ok(TopicHandle::from(description))
    }
}
