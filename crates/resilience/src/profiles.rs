//! Per-dependency-class presets and error classifiers
//!
//! The background services protect three kinds of outbound calls: HTTP
//! APIs, file transfers and database access. The presets here encode the
//! retry/breaker parameters each class has settled on; the classifiers
//! back the default transient-error retry decision and the caller-supplied
//! failure predicates.
//!
//! Classification works on error display text. The services wrap transport
//! errors from several client libraries, so downcasting to concrete types
//! is not an option at this layer.

use std::time::Duration;

use crate::backoff::{BackoffStrategy, Jitter};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;

/// Check if an error is network-related and worth retrying.
pub fn is_network_error(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("connection")
        || text.contains("timeout")
        || text.contains("timed out")
        || text.contains("network")
        || text.contains("dns")
        || text.contains("refused")
        || text.contains("reset")
        || text.contains("broken pipe")
        || text.contains("unreachable")
}

/// Check if an error is a transient database error.
pub fn is_database_transient_error(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("deadlock")
        || text.contains("lock")
        || text.contains("busy")
        || text.contains("serialization failure")
        || text.contains("too many connections")
        || text.contains("could not connect")
        || text.contains("connection pool")
}

/// Check if an HTTP API error is retryable.
///
/// Client errors (4xx) are permanent except rate limiting; server errors
/// and network failures are retryable.
pub fn is_api_retryable_error(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_lowercase();

    if text.contains("429") || text.contains("rate limit") || text.contains("too many requests") {
        return true;
    }
    if text.contains("400")
        || text.contains("401")
        || text.contains("403")
        || text.contains("404")
        || text.contains("405")
        || text.contains("409")
    {
        return false;
    }

    text.contains("500")
        || text.contains("502")
        || text.contains("503")
        || text.contains("504")
        || text.contains("gateway")
        || text.contains("service unavailable")
        || is_network_error(error)
}

/// Check if a filesystem error is transient.
pub fn is_filesystem_transient_error(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("temporarily unavailable")
        || text.contains("resource busy")
        || text.contains("locked")
        || text.contains("in use")
        || text.contains("interrupted")
        || text.contains("would block")
        || text.contains("timed out")
}

/// Generic retryability classifier used when the caller supplies no
/// policy of their own.
///
/// Default-retryable: only errors that clearly describe a permanent
/// condition stop the retry loop. Everything else is treated as transient,
/// matching how the services classify unknown transport failures.
pub fn is_transient_error(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_lowercase();

    let permanent = text.contains("400")
        || text.contains("401")
        || text.contains("403")
        || text.contains("404")
        || text.contains("405")
        || text.contains("409")
        || text.contains("invalid")
        || text.contains("validation")
        || text.contains("unauthorized")
        || text.contains("forbidden")
        || text.contains("not found")
        || text.contains("malformed")
        || text.contains("unsupported");

    !permanent
}

/// Retry presets for the outbound-call classes the services protect.
pub struct RetryProfiles;

impl RetryProfiles {
    /// Network transfers: patient, with long decorrelated backoff.
    pub fn network() -> RetryConfig {
        RetryConfig {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Some(Duration::from_secs(30)),
            backoff: BackoffStrategy::Exponential,
            jitter: Jitter::Decorrelated,
            multiplier: 2.0,
            max_total_time: Some(Duration::from_secs(300)),
        }
    }

    /// External HTTP APIs: few attempts, tight total budget.
    pub fn http_api() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Some(Duration::from_secs(5)),
            backoff: BackoffStrategy::Exponential,
            jitter: Jitter::Full,
            multiplier: 2.0,
            max_total_time: Some(Duration::from_secs(30)),
        }
    }

    /// Database calls: quick exponential backoff for lock contention.
    pub fn database() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(10)),
            backoff: BackoffStrategy::Exponential,
            jitter: Jitter::Equal,
            multiplier: 2.0,
            max_total_time: Some(Duration::from_secs(60)),
        }
    }

    /// Local filesystem operations: short fixed delays.
    pub fn filesystem() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Some(Duration::from_secs(1)),
            backoff: BackoffStrategy::Linear,
            jitter: Jitter::Equal,
            multiplier: 1.0,
            max_total_time: Some(Duration::from_secs(5)),
        }
    }
}

/// Circuit breaker presets matching the retry profiles.
pub struct BreakerProfiles;

impl BreakerProfiles {
    /// Network transfers: slow to trip, slow to probe.
    pub fn network(name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            request_timeout: Some(Duration::from_secs(120)),
        }
    }

    /// External HTTP APIs: trips fast, probes after half a minute.
    pub fn http_api(name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            request_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Database calls: tolerates brief contention before tripping.
    pub fn database(name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            failure_threshold: 8,
            failure_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(15),
            success_threshold: 2,
            request_timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(String);

    fn err(text: &str) -> TestError {
        TestError(text.to_string())
    }

    #[test]
    fn test_network_classifier() {
        assert!(is_network_error(&err("connection refused")));
        assert!(is_network_error(&err("DNS lookup failed")));
        assert!(is_network_error(&err("read: connection reset by peer")));
        assert!(!is_network_error(&err("invalid certificate payload")));
    }

    #[test]
    fn test_database_classifier() {
        assert!(is_database_transient_error(&err("database is locked")));
        assert!(is_database_transient_error(&err("deadlock detected")));
        assert!(!is_database_transient_error(&err("syntax error in query")));
    }

    #[test]
    fn test_api_classifier_splits_client_and_server_errors() {
        assert!(is_api_retryable_error(&err("503 service unavailable")));
        assert!(is_api_retryable_error(&err("502 bad gateway")));
        assert!(is_api_retryable_error(&err("429 too many requests")));
        assert!(!is_api_retryable_error(&err("404 not found")));
        assert!(!is_api_retryable_error(&err("401 unauthorized")));
    }

    #[test]
    fn test_filesystem_classifier() {
        assert!(is_filesystem_transient_error(&err("resource busy")));
        assert!(is_filesystem_transient_error(&err("operation would block")));
        assert!(!is_filesystem_transient_error(&err("permission denied")));
    }

    #[test]
    fn test_transient_classifier_is_default_retryable() {
        assert!(is_transient_error(&err("connection refused")));
        assert!(is_transient_error(&err("something unexpected happened")));
        assert!(!is_transient_error(&err("404 not found")));
        assert!(!is_transient_error(&err("validation failed: missing field")));
        assert!(!is_transient_error(&err("unauthorized")));
    }

    #[test]
    fn test_retry_profiles_validate() {
        for config in [
            RetryProfiles::network(),
            RetryProfiles::http_api(),
            RetryProfiles::database(),
            RetryProfiles::filesystem(),
        ] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_breaker_profiles_validate() {
        for config in [
            BreakerProfiles::network("n"),
            BreakerProfiles::http_api("h"),
            BreakerProfiles::database("d"),
        ] {
            assert!(config.validate().is_ok());
        }
    }
}
