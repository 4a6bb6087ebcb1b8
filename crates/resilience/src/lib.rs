//! Resilience layer protecting Breakwater's outbound calls.
//!
//! Every background service talks to something that fails: third-party
//! HTTP APIs, file transfers, the database. This crate is the single
//! decision point for how those failures are handled:
//!
//! - [`circuit_breaker::CircuitBreaker`]: stops invoking a failing
//!   dependency once failures inside a sliding time window cross a
//!   threshold, then periodically probes recovery.
//! - [`retry::RetryExecutor`]: repeats an operation with configurable
//!   backoff and jitter until success, a non-retryable error, or an
//!   attempt/time budget runs out.
//! - [`executor::ResilienceExecutor`]: composes timeout, retry, circuit
//!   breaking and fallback into one unified result per call.
//! - [`client::ResilientClient`]: wraps a client value so every call is
//!   routed through one shared executor for that dependency.
//!
//! One executor (or breaker) instance guards one logical dependency and
//! lives for the process lifetime. Instances never share mutable state;
//! independent breakers never block each other.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod error;
pub mod executor;
pub mod profiles;
pub mod retry;
pub mod serde_util;

// Re-export commonly used types for convenience
// ------------------------------
pub use backoff::{BackoffStrategy, DelayCalculator, Jitter};
pub use circuit_breaker::{
    BreakerReport, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig,
    CircuitBreakerMetrics, CircuitState, FailureRecord,
};
pub use client::ResilientClient;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
pub use executor::{
    ResilienceConfig, ResilienceExecutor, ResilienceExecutorBuilder, ResilienceMetrics,
    ResilienceOutcome,
};
pub use profiles::{BreakerProfiles, RetryProfiles};
pub use retry::{
    policies, retry_with_policy, RetryAttempt, RetryConfig, RetryConfigBuilder, RetryDecision,
    RetryError, RetryExecutor, RetryOutcome, RetryPolicy, RetryResult,
};
pub use serde_util::duration_millis;
