//! Error types for webhook delivery operations.
//!
//! Mirrors the failure taxonomy of a delivery sequence: configuration
//! problems caught before any network call, transport and application
//! failures of a single attempt, and exhaustion of a whole sequence. None of
//! the messages carry header values; callers scrub third-party text through
//! `WebhookHeaders::redact` before it lands here.

use std::time::Duration;

use cdc_webhook_core::{CoreError, DeliveryOutcome, TriggerKey};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Invalid delivery configuration, rejected before any attempt.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// What was wrong
        message: String,
    },

    /// Network, DNS or timeout failure during one attempt.
    #[error("transport error: {message}")]
    Transport {
        /// Redacted client error text
        message: String,
    },

    /// The sink answered with a non-2xx status.
    #[error("HTTP {status}")]
    Application {
        /// Status code returned by the sink
        status: u16,
    },

    /// Every attempt of a delivery sequence failed.
    #[error("webhook delivery failed: {message}")]
    Exhausted {
        /// Accumulated per-attempt failure description
        message: String,
        /// Attempts made
        attempts: u32,
        /// Whether the producing unit of work must be rolled back
        abort: bool,
    },

    /// A PRIVATE binding has no stored credentials.
    #[error("no credentials stored for trigger {trigger}")]
    CredentialsNotFound {
        /// Binding whose credentials are missing
        trigger: TriggerKey,
    },

    /// Queue or credential store failure.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Worker did not stop within the shutdown timeout.
    #[error("dispatcher shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Worker task panicked.
    #[error("dispatcher worker panicked: {error}")]
    WorkerPanic {
        /// Join error description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates an application error from a sink status code.
    pub fn application(status: u16) -> Self {
        Self::Application { status }
    }

    /// Creates an exhaustion error.
    pub fn exhausted(message: impl Into<String>, attempts: u32, abort: bool) -> Self {
        Self::Exhausted { message: message.into(), attempts, abort }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Classifies a failed attempt; `None` for a successful one.
    pub fn from_outcome(outcome: &DeliveryOutcome) -> Option<Self> {
        if outcome.success {
            return None;
        }
        Some(match outcome.http_status {
            Some(status) => Self::application(status),
            None => {
                let detail = outcome.error_detail.as_deref().unwrap_or("unknown failure");
                Self::transport(detail.strip_prefix("transport error: ").unwrap_or(detail))
            },
        })
    }

    /// Whether the producing unit of work must be rolled back.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Exhausted { abort: true, .. })
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::Configuration { message },
            other => Self::Storage { message: other.to_string() },
        }
    }
}
