//! Error types for webhook dispatch operations.
//!
//! Categorizes every way an attempt can fail so the dispatcher can decide
//! between scheduling a retry and failing the delivery terminally.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error taxonomy for webhook dispatch.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network error: {message}")]
    Network {
        /// Description of the connection failure.
        message: String,
    },

    /// The target did not respond within its configured timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout budget that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The target responded with something other than HTTP 200.
    ///
    /// Success is HTTP 200 only; every other status, 2xx included, lands
    /// here and is evaluated against the retry budget.
    #[error("unexpected status {status_code}")]
    UnexpectedStatus {
        /// HTTP status code received.
        status_code: u16,
        /// Response body, bounded at capture time.
        body: String,
    },

    /// The target was disabled before the attempt started.
    #[error("target disabled")]
    TargetDisabled,

    /// The delivery spent its whole attempt budget.
    #[error("delivery failed after {attempts} attempts")]
    AttemptsExhausted {
        /// Attempts made before giving up.
        attempts: i32,
    },

    /// A storage operation failed during dispatch.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying storage error text.
        message: String,
    },

    /// Invalid configuration (unusable URL, client build failure).
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error text.
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Internal error text.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates an unexpected-status error from an HTTP response.
    pub fn unexpected_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this failure is eligible for another attempt, budget
    /// permitting.
    ///
    /// Network errors, timeouts, and non-200 responses are transient from
    /// the engine's point of view. Disabled targets and exhausted budgets
    /// are terminal; configuration and internal errors never retry.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::UnexpectedStatus { .. } => true,
            Self::TargetDisabled
            | Self::AttemptsExhausted { .. }
            | Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// HTTP status code associated with this error, if one was received.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<relay_core::CoreError> for DeliveryError {
    fn from(err: relay_core::CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}
