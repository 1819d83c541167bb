//! Public, broker-agnostic bus configuration.
//!
//! This type intentionally contains no broker-specific concepts (connection
//! strings, credentials). Broker clients are constructed by the application
//! and handed to the [`ServiceBusBuilder`](crate::ServiceBusBuilder).

use std::time::Duration;

use crate::naming::MAX_APPLICATION_ID_LEN;
use crate::{BusError, ReceiveStrategy, Result, RetryPolicy};

/// Bus configuration.
///
/// Built once, validated by [`ServiceBusBuilder::build`](crate::ServiceBusBuilder::build)
/// and shared read-only by every component of the bus afterwards.
///
/// # Example
///
/// ```
/// use mom_pubsub::{BusConfig, ReceiveStrategy};
/// use std::time::Duration;
///
/// let config = BusConfig::new("billing", "orders")
///     .with_receive_strategy(ReceiveStrategy::Push)
///     .with_send_timeout(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    // ---
    /// Application id, prefixed to exclusive subscription names.
    ///
    /// At most 17 characters so that derived names stay within the broker's
    /// 50 character limit.
    pub application_id: String,

    /// Topic every message of this bus is published to and received from.
    pub topic_name: String,

    /// Retry policy for existence checks. Default: [`RetryPolicy::existence_probe`].
    pub probe_policy: RetryPolicy,

    /// Retry policy for every other broker round-trip. Default: [`RetryPolicy::standard`].
    pub standard_policy: RetryPolicy,

    /// How long [`ServiceBus::send`](crate::ServiceBus::send) waits for a
    /// terminal result.
    ///
    /// Default: 60 seconds
    pub send_timeout: Duration,

    /// Server wait of one pull receive, or of one pump receive.
    ///
    /// Also bounds how long an in-flight pull receive can delay cancellation.
    ///
    /// Default: 5 seconds
    pub receive_wait: Duration,

    /// Pull or push receive loops. Default: [`ReceiveStrategy::Pull`].
    pub receive_strategy: ReceiveStrategy,

    /// How often cancellation checks whether the receive loop has completed.
    ///
    /// Default: 30
    pub cancel_poll_attempts: u32,

    /// Sleep between two cancellation checks.
    ///
    /// Default: 250 milliseconds
    pub cancel_poll_interval: Duration,

    /// Pause before a receive loop restarts after a broker fault.
    ///
    /// Default: 1 second
    pub error_restart_delay: Duration,
}

impl BusConfig {
    /// Create a configuration with default timings.
    pub fn new(application_id: impl Into<String>, topic_name: impl Into<String>) -> Self {
        // ---
        Self {
            application_id: application_id.into(),
            topic_name: topic_name.into(),
            probe_policy: RetryPolicy::existence_probe(),
            standard_policy: RetryPolicy::standard(),
            send_timeout: Duration::from_secs(60),
            receive_wait: Duration::from_secs(5),
            receive_strategy: ReceiveStrategy::Pull,
            cancel_poll_attempts: 30,
            cancel_poll_interval: Duration::from_millis(250),
            error_restart_delay: Duration::from_secs(1),
        }
    }

    /// Set the existence-probe retry policy.
    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    /// Set the retry policy for sends, receives, creates and deletes.
    pub fn with_standard_policy(mut self, policy: RetryPolicy) -> Self {
        self.standard_policy = policy;
        self
    }

    /// Set the synchronous send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the server wait of one receive.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Choose pull or push receive loops.
    pub fn with_receive_strategy(mut self, strategy: ReceiveStrategy) -> Self {
        self.receive_strategy = strategy;
        self
    }

    /// Set the bounded wait used by cancellation.
    ///
    /// The total wait is at most `attempts × interval`.
    pub fn with_cancel_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.cancel_poll_attempts = attempts;
        self.cancel_poll_interval = interval;
        self
    }

    /// Set the pause before a receive loop restarts after a fault.
    pub fn with_error_restart_delay(mut self, delay: Duration) -> Self {
        self.error_restart_delay = delay;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Configuration`] when the application id is empty or
    /// too long, the topic name is empty, or a timing would stall the bus.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.application_id.trim().is_empty() {
            return Err(BusError::Configuration("application id is required".into()));
        }
        if self.application_id.len() > MAX_APPLICATION_ID_LEN {
            return Err(BusError::Configuration(format!(
                "application id {:?} exceeds {MAX_APPLICATION_ID_LEN} characters",
                self.application_id
            )));
        }
        if self.topic_name.trim().is_empty() {
            return Err(BusError::Configuration("topic name is required".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(BusError::Configuration("send timeout must be non-zero".into()));
        }
        if self.receive_wait.is_zero() {
            return Err(BusError::Configuration("receive wait must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults_validate() {
        // ---
        let config = BusConfig::new("shop", "events");
        assert!(config.validate().is_ok());
        assert_eq!(config.receive_strategy, ReceiveStrategy::Pull);
        assert_eq!(config.standard_policy, RetryPolicy::standard());
        assert_eq!(config.probe_policy, RetryPolicy::existence_probe());
    }

    #[test]
    fn test_missing_or_long_application_id_rejected() {
        // ---
        assert!(BusConfig::new("", "events").validate().is_err());
        assert!(BusConfig::new("a".repeat(MAX_APPLICATION_ID_LEN), "events")
            .validate()
            .is_ok());
        assert!(BusConfig::new("a".repeat(MAX_APPLICATION_ID_LEN + 1), "events")
            .validate()
            .is_err());
    }

    #[test]
    fn test_zero_timings_rejected() {
        // ---
        let config = BusConfig::new("shop", "events").with_send_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));

        let config = BusConfig::new("shop", "events").with_receive_wait(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));

        let config = BusConfig::new("shop", " ");
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));
    }
}
