//! Error taxonomy for the resilience layer
//!
//! One error enum covers every failure a protected call can surface:
//! synthetic rejections from an open circuit, timeouts raised by the core's
//! own wrappers, pass-through operation failures and fallback failures.
//! The enum is generic over the underlying operation error type `E` so the
//! original error is preserved and recoverable verbatim.

use std::time::Duration;

use thiserror::Error;

/// Configuration validation error.
///
/// Raised eagerly at construction time; invalid configuration is never
/// silently corrected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration field failed validation.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// What was wrong with the configuration.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Errors that can occur while executing a protected operation.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit breaker rejected the call while open.
    #[error("circuit breaker '{name}' is open, next probe in {retry_in:?}")]
    CircuitOpen {
        /// Name of the rejecting breaker.
        name: String,
        /// Time remaining until the breaker admits a probe call.
        retry_in: Duration,
    },

    /// The core's own timeout wrapper fired before the operation finished.
    #[error("operation timed out after {elapsed:?}")]
    Timeout {
        /// How long the operation was given.
        elapsed: Duration,
    },

    /// The underlying operation failed; the error is passed through
    /// unchanged.
    #[error("operation failed: {source}")]
    OperationFailed {
        /// The original operation error.
        #[source]
        source: E,
    },

    /// The fallback itself failed after all other layers were exhausted.
    #[error("fallback failed: {source}")]
    FallbackFailed {
        /// The error raised by the fallback.
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Recover the underlying operation (or fallback) error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } | Self::FallbackFailed { source } => Some(source),
            Self::CircuitOpen { .. } | Self::Timeout { .. } => None,
        }
    }

    /// Whether this error is a circuit-breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this error came from the core's own timeout wrapper.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for protected operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Result type for configuration and construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("{message}")]
    struct TestError {
        message: String,
    }

    #[test]
    fn test_circuit_open_display_carries_name_and_probe_time() {
        let err: ResilienceError<TestError> = ResilienceError::CircuitOpen {
            name: "billing-api".to_string(),
            retry_in: Duration::from_secs(30),
        };
        let text = err.to_string();
        assert!(text.contains("billing-api"));
        assert!(text.contains("open"));
    }

    #[test]
    fn test_timeout_is_textually_distinguishable() {
        let err: ResilienceError<TestError> =
            ResilienceError::Timeout { elapsed: Duration::from_millis(500) };
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_timeout());
        assert!(!err.is_circuit_open());
    }

    #[test]
    fn test_into_inner_recovers_operation_error() {
        let err: ResilienceError<TestError> = ResilienceError::OperationFailed {
            source: TestError { message: "boom".to_string() },
        };
        let inner = err.into_inner().expect("operation error should be recoverable");
        assert_eq!(inner.message, "boom");

        let rejected: ResilienceError<TestError> = ResilienceError::CircuitOpen {
            name: "x".to_string(),
            retry_in: Duration::ZERO,
        };
        assert!(rejected.into_inner().is_none());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("failure_threshold must be at least 1");
        assert!(err.to_string().contains("failure_threshold"));
    }
}
