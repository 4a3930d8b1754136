//! Error types for outbound webhook delivery.
//!
//! Delivery failures carry enough context (status, body excerpt, transport
//! message) to be recorded on the event for operators. The dispatcher turns
//! every delivery error into event state; only lookups and queueing return
//! these errors to callers.

use carelink_core::{CoreError, IntegrationConfigId};
use thiserror::Error;

/// Result type alias for webhook operations.
pub type Result<T> = std::result::Result<T, WebhookError>;

/// Errors raised while queueing or delivering webhooks.
#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    /// Config or event does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Entity kind and id
        message: String,
    },

    /// The config has no webhook URL.
    #[error("integration {config_id} has no webhook configured")]
    NoWebhookConfigured {
        /// Config without a URL
        config_id: IntegrationConfigId,
    },

    /// The receiver answered with a non-2xx status.
    #[error("delivery rejected: HTTP {status_code}")]
    Delivery {
        /// Response status
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network {
        /// Underlying transport error
        message: String,
    },

    /// The receiver did not answer in time.
    #[error("delivery timed out after {timeout_seconds}s")]
    Timeout {
        /// Bound that was exceeded
        timeout_seconds: u64,
    },

    /// Client or URL setup failure.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is invalid
        message: String,
    },

    /// Persistence failure.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },
}

impl WebhookError {
    /// Creates a not-found error naming the entity.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound { message: format!("{kind} {id}") }
    }

    /// Creates a delivery error from a response.
    pub fn delivery(status_code: u16, body: impl Into<String>) -> Self {
        Self::Delivery { status_code, body: body.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true for failures a later attempt may fix.
    ///
    /// Every delivery-side failure qualifies: receivers that answer 4xx are
    /// retried too, since their configuration can change between attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery { .. } | Self::Network { .. } | Self::Timeout { .. } => true,
            Self::NotFound { .. }
            | Self::NoWebhookConfigured { .. }
            | Self::Configuration { .. }
            | Self::Storage { .. } => false,
        }
    }
}

impl From<CoreError> for WebhookError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::NotFound { message },
            other => Self::Storage { message: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_failures_are_retryable() {
        assert!(WebhookError::delivery(500, "boom").is_retryable());
        assert!(WebhookError::delivery(404, "").is_retryable());
        assert!(WebhookError::network("reset").is_retryable());
        assert!(WebhookError::timeout(10).is_retryable());
        assert!(!WebhookError::not_found("WebhookEvent", "x").is_retryable());
    }

    #[test]
    fn display_includes_status() {
        assert_eq!(WebhookError::delivery(503, "down").to_string(), "delivery rejected: HTTP 503");
    }

    #[test]
    fn core_errors_map_to_storage() {
        let err = WebhookError::from(CoreError::Database("pool closed".into()));
        assert!(matches!(err, WebhookError::Storage { .. }));
    }
}
