//! Error types for adapters, circuit breaking and sync orchestration.
//!
//! Distinguishes failures of the external system (network, auth, unexpected
//! responses) from caller-input errors (unknown config, inactive, already
//! syncing) so the breaker and retry loop can treat them differently.

use std::fmt;

use carelink_core::{CoreError, IntegrationConfigId};
use thiserror::Error;

/// Result type alias for integration operations.
pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Errors raised by adapters and the sync orchestrator.
#[derive(Debug, Clone, Error)]
pub enum IntegrationError {
    /// Endpoint or credentials missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is missing or invalid
        message: String,
    },

    /// The external system rejected our credentials or token request.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Reason reported by the adapter
        message: String,
    },

    /// Unknown sub-type or unexpected response shape.
    #[error("adapter error: {message}")]
    Adapter {
        /// Adapter-specific description
        message: String,
    },

    /// The breaker rejected the call without invoking the operation.
    #[error("circuit breaker open for {name}")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
    },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network {
        /// Underlying transport error
        message: String,
    },

    /// Operation exceeded its time bound.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Bound that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// A sync is already running for this config.
    #[error("integration {config_id} is already syncing")]
    AlreadySyncing {
        /// Config that is syncing
        config_id: IntegrationConfigId,
    },

    /// The config is switched off.
    #[error("integration {config_id} is not active")]
    Inactive {
        /// Inactive config
        config_id: IntegrationConfigId,
    },

    /// The config was paused by an operator.
    #[error("integration {config_id} is paused")]
    Paused {
        /// Paused config
        config_id: IntegrationConfigId,
    },

    /// Entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Entity kind and id
        message: String,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the operation was refused
        message: String,
    },

    /// A sync ran and failed; wraps the cause.
    #[error("sync failed: {message}")]
    SyncFailed {
        /// Message of the underlying failure
        message: String,
    },

    /// Persistence failure.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },
}

impl IntegrationError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Creates an adapter error.
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter { message: message.into() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(name: impl Into<String>) -> Self {
        Self::CircuitOpen { name: name.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error from the exceeded bound.
    pub fn timeout(bound: std::time::Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a not-found error naming the entity.
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Self::NotFound { message: format!("{kind} {id}") }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Wraps a failure cause as a sync failure.
    pub fn sync_failed(cause: &Self) -> Self {
        Self::SyncFailed { message: cause.to_string() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Maps a reqwest failure onto network or timeout errors.
    pub fn from_http(err: &reqwest::Error, bound: std::time::Duration) -> Self {
        if err.is_timeout() {
            Self::timeout(bound)
        } else if err.is_connect() {
            Self::network(format!("connection failed: {err}"))
        } else {
            Self::network(err.to_string())
        }
    }

    /// Returns true for transient failures worth retrying.
    ///
    /// Network failures and timeouts are retryable. Caller-input errors,
    /// configuration and authentication failures, and breaker rejections are
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,

            Self::Configuration { .. }
            | Self::Authentication { .. }
            | Self::Adapter { .. }
            | Self::CircuitOpen { .. }
            | Self::AlreadySyncing { .. }
            | Self::Inactive { .. }
            | Self::Paused { .. }
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::SyncFailed { .. }
            | Self::Storage { .. } => false,
        }
    }

    /// Returns true for errors caused by the request rather than the
    /// external system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadySyncing { .. }
                | Self::Inactive { .. }
                | Self::Paused { .. }
                | Self::NotFound { .. }
                | Self::InvalidState { .. }
        )
    }
}

impl From<CoreError> for IntegrationError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::InvalidInput(message) => Self::Configuration { message },
            other => Self::Storage { message: other.to_string() },
        }
    }
}

/// Category of integration error for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Network,
    /// Credentials and tokens.
    Authentication,
    /// Unexpected behaviour of the external system.
    Adapter,
    /// Breaker protection.
    Circuit,
    /// Missing or malformed configuration.
    Configuration,
    /// Invalid request from the caller.
    Caller,
    /// Persistence.
    Storage,
}

impl From<&IntegrationError> for ErrorCategory {
    fn from(error: &IntegrationError) -> Self {
        match error {
            IntegrationError::Network { .. } | IntegrationError::Timeout { .. } => Self::Network,
            IntegrationError::Authentication { .. } => Self::Authentication,
            IntegrationError::Adapter { .. } | IntegrationError::SyncFailed { .. } => Self::Adapter,
            IntegrationError::CircuitOpen { .. } => Self::Circuit,
            IntegrationError::Configuration { .. } => Self::Configuration,
            IntegrationError::AlreadySyncing { .. }
            | IntegrationError::Inactive { .. }
            | IntegrationError::Paused { .. }
            | IntegrationError::NotFound { .. }
            | IntegrationError::InvalidState { .. } => Self::Caller,
            IntegrationError::Storage { .. } => Self::Storage,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Authentication => write!(f, "authentication"),
            Self::Adapter => write!(f, "adapter"),
            Self::Circuit => write!(f, "circuit"),
            Self::Configuration => write!(f, "configuration"),
            Self::Caller => write!(f, "caller"),
            Self::Storage => write!(f, "storage"),
        }
    }
}
