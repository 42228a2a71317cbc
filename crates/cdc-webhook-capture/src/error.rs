//! Error types for trigger configuration and event capture.

use cdc_webhook_core::CoreError;
use cdc_webhook_delivery::DeliveryError;
use thiserror::Error;

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Error types for trigger configuration and event capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The trigger configuration was rejected; nothing was created.
    #[error("invalid trigger configuration: {message}")]
    Configuration {
        /// What was wrong
        message: String,
    },

    /// A SYNC binding with `cancel_on_failure` exhausted its attempts. The
    /// row change that produced the event must be rolled back.
    #[error("{message}")]
    Aborted {
        /// Exhaustion message, header values already scrubbed
        message: String,
    },

    /// Delivery failed in a way that is not an exhaustion decision.
    #[error(transparent)]
    Delivery(DeliveryError),

    /// Binding, credential or queue storage failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },
}

impl CaptureError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Whether the producing unit of work must be rolled back.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<CoreError> for CaptureError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::Configuration { message },
            other => Self::Storage { message: other.to_string() },
        }
    }
}

impl From<DeliveryError> for CaptureError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Exhausted { abort: true, .. } => Self::Aborted { message: err.to_string() },
            DeliveryError::Configuration { message } => Self::Configuration { message },
            DeliveryError::Storage { message } => Self::Storage { message },
            other => Self::Delivery(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborting_exhaustion_becomes_aborted() {
        let err = CaptureError::from(DeliveryError::exhausted("Attempt 1/1 failed. HTTP 500.", 1, true));
        assert!(err.is_abort());
        assert_eq!(err.to_string(), "webhook delivery failed: Attempt 1/1 failed. HTTP 500.");
    }

    #[test]
    fn invalid_input_is_configuration_error() {
        let err = CaptureError::from(CoreError::invalid_input("retry_interval must be > 0"));
        assert!(matches!(err, CaptureError::Configuration { .. }));
        assert!(!err.is_abort());
    }
}
