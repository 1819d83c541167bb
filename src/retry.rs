//! Retry policy and fault classification.
//!
//! Every broker round-trip in this crate runs through [`RetryPolicy::execute`]
//! together with one of two classifiers:
//!
//! - [`is_transient`]: the standard classifier used for sends, receives,
//!   creates and deletes.
//! - [`is_transient_probe`]: a stricter classifier used when merely checking
//!   whether a topic or subscription exists. "Not found" is an answer there,
//!   not a fault, and 404-shaped errors must not be retried.
//!
//! # Retry Strategy
//!
//! - Non-transient errors propagate on the first failure
//! - Transient errors are retried until `max_attempts` total attempts were made,
//!   then surface as [`BusError::RetryLimitExceeded`] carrying the last cause
//! - Delay grows as `min_backoff + backoff_step * (2^(n-1) - 1)`, capped at
//!   `max_backoff`, with ±25% jitter to prevent thundering herd

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

use crate::{BrokerError, BusError, Result};

/// Bounded retry with exponential-ish backoff.
///
/// # Example
///
/// ```
/// use mom_pubsub::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     min_backoff: Duration::from_millis(50),
///     backoff_step: Duration::from_millis(100),
///     max_backoff: Duration::from_secs(2),
/// };
/// assert_eq!(policy.backoff_delay(1), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (a value of 0 behaves like 1).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub min_backoff: Duration,

    /// Base increment; doubled after every further retry.
    pub backoff_step: Duration,

    /// Upper bound for a single delay (before jitter).
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy for sends, receives, creates and deletes.
    ///
    /// - `max_attempts`: 30
    /// - `min_backoff`: 100ms
    /// - `backoff_step`: 100ms
    /// - `max_backoff`: 5s
    pub fn standard() -> Self {
        // ---
        Self {
            max_attempts: 30,
            min_backoff: Duration::from_millis(100),
            backoff_step: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Policy for existence checks.
    ///
    /// - `max_attempts`: 5
    /// - `min_backoff`: 100ms
    /// - `backoff_step`: 100ms
    /// - `max_backoff`: 2s
    pub fn existence_probe() -> Self {
        // ---
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_millis(100),
            backoff_step: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        // ---
        let exponent = retry.saturating_sub(1).min(20);
        let factor = (1u32 << exponent) - 1;
        let delay = self
            .min_backoff
            .saturating_add(self.backoff_step.saturating_mul(factor));
        delay.min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// attempt ceiling is reached.
    ///
    /// A fresh future is created for every attempt, so anything the operation
    /// builds (request bodies, envelopes) is rebuilt per attempt.
    ///
    /// # Errors
    ///
    /// - the operation's own error when `is_transient` rejects it
    /// - [`BusError::RetryLimitExceeded`] after `max_attempts` transient failures
    pub async fn execute<F, Fut, T, C>(&self, mut operation: F, is_transient: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&BusError) -> bool,
    {
        // ---
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) if !is_transient(&err) => {
                    // Fatal, fail immediately
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        crate::log_debug!(
                            "retry exhausted after {attempt} attempts, last error: {err}"
                        );
                        return Err(BusError::RetryLimitExceeded {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let jittered_delay = apply_jitter(self.backoff_delay(attempt));

                    crate::log_debug!(
                        "attempt {attempt}/{max_attempts} failed, retrying in {jittered_delay:?} (error: {err})"
                    );

                    sleep(jittered_delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Standard transient-fault classifier.
///
/// Transient: timeouts, communication faults, server-busy, token acquisition
/// failures and provider faults with a 5xx code. Everything else, including
/// not-found, already-exists, lock-lost, peer faults and authorization
/// failures, is fatal.
pub fn is_transient(err: &BusError) -> bool {
    // ---
    let Some(broker_err) = direct_broker_error(err) else {
        return false;
    };

    match broker_err {
        BrokerError::Timeout(_)
        | BrokerError::Communication(_)
        | BrokerError::ServerBusy(_)
        | BrokerError::TokenAcquisition(_) => true,
        BrokerError::Provider(_) => {
            matches!(broker_err.provider_code(), Some(code) if (500..600).contains(&code))
        }
        BrokerError::NotFound(_)
        | BrokerError::AlreadyExists(_)
        | BrokerError::LockLost(_)
        | BrokerError::Unauthorized(_)
        | BrokerError::PeerFault(_)
        | BrokerError::Closed => false,
    }
}

/// Existence-probe classifier.
///
/// Same as [`is_transient`], except that errors which look like an HTTP 404
/// are never retried even when they arrive as communication or provider
/// faults.
pub fn is_transient_probe(err: &BusError) -> bool {
    // ---
    match direct_broker_error(err) {
        Some(BrokerError::NotFound(_)) => false,
        Some(broker_err @ BrokerError::Provider(_)) if broker_err.provider_code() == Some(404) => {
            false
        }
        Some(BrokerError::Communication(detail)) | Some(BrokerError::Provider(detail))
            if looks_like_404(detail) =>
        {
            false
        }
        _ => is_transient(err),
    }
}

// A RetryLimitExceeded coming back from a nested policy is already final.
fn direct_broker_error(err: &BusError) -> Option<&BrokerError> {
    match err {
        BusError::Broker(broker_err) => Some(broker_err),
        _ => None,
    }
}

fn looks_like_404(detail: &str) -> bool {
    detail.contains("(404)") || detail.contains("404 Not Found") || detail.contains("<Code>404</Code>")
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    // Range of 0.75x to 1.25x the original delay
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
