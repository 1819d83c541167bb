//! Error types.
//!
//! [`BrokerError`] describes faults reported by the broker client. Its
//! variants are what the retry classifiers in [`crate::retry`] look at.
//! [`BusError`] is the crate-wide error returned from every public operation.

use std::time::Duration;
use thiserror::Error;

/// Faults reported by a [`BrokerClient`](crate::BrokerClient).
///
/// The variants mirror the fault classes a topic/subscription broker reports.
/// Whether a variant is retried is decided by the classifiers in
/// [`crate::retry`], not by the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The addressed topic, subscription or message does not exist.
    #[error("messaging entity not found: {0}")]
    NotFound(String),

    /// A create call lost a race against another creator.
    #[error("messaging entity already exists: {0}")]
    AlreadyExists(String),

    /// The peek-lock on a message expired or was already released.
    #[error("message lock lost: {0}")]
    LockLost(String),

    /// The broker round-trip did not complete in time.
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    /// Connection or transport level failure.
    #[error("broker communication failure: {0}")]
    Communication(String),

    /// The broker asked the client to back off.
    #[error("broker is busy: {0}")]
    ServerBusy(String),

    /// Acquiring the security token for the request failed.
    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote side returned a fault that is not worth repeating.
    #[error("fault from peer: {0}")]
    PeerFault(String),

    /// Provider error carrying a structured message such as
    /// `<Error><Code>500</Code><Detail>...</Detail></Error>`.
    #[error("provider error: {0}")]
    Provider(String),

    /// The broker client has been closed.
    #[error("broker client closed")]
    Closed,
}

impl BrokerError {
    /// Status code embedded in a structured provider message, if any.
    ///
    /// Looks for the first `<Code>NNN</Code>` element.
    pub fn provider_code(&self) -> Option<u16> {
        // ---
        let BrokerError::Provider(detail) = self else {
            return None;
        };

        let start = detail.find("<Code>")? + "<Code>".len();
        let end = start + detail[start..].find("</Code>")?;
        detail[start..end].trim().parse().ok()
    }
}

/// Errors that can occur during bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// Required setup is missing or malformed. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A fault reported by the broker client.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A transient fault persisted for every allowed attempt.
    #[error("retry limit exceeded after {attempts} attempts")]
    RetryLimitExceeded {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<BusError>,
    },

    /// Payload serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A send did not reach a terminal result within its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The bus has been shut down.
    #[error("bus is shut down")]
    ShutDown,
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl BusError {
    /// The broker fault behind this error, looking through retry wrapping.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        // ---
        match self {
            BusError::Broker(err) => Some(err),
            BusError::RetryLimitExceeded { source, .. } => source.broker_error(),
            _ => None,
        }
    }

    /// True when the underlying broker fault is "entity not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self.broker_error(), Some(BrokerError::NotFound(_)))
    }

    /// True when the underlying broker fault is "entity already exists".
    pub fn is_already_exists(&self) -> bool {
        matches!(self.broker_error(), Some(BrokerError::AlreadyExists(_)))
    }
}

/// Error type returned by user message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
