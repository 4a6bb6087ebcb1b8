//! Composite executor layering timeout, retry, circuit breaking and
//! fallback around an arbitrary asynchronous operation
//!
//! Composition precedence is fixed: when both a circuit breaker and a retry
//! policy are configured, the retry loop wraps the breaker, so every
//! attempt is routed through it and an open breaker fails the remaining
//! attempts fast instead of waiting out per-request timeouts. The overall
//! timeout, when configured, races the entire composed call.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::{
    BreakerHooks, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    FailureClassifier,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::retry::policies::TransientRetry;
use crate::retry::{
    ExhaustedHook, RetryAttempt, RetryConfig, RetryDecision, RetryExecutor, RetryHook, RetryPolicy,
};
use crate::serde_util::duration_millis_opt;

/// Configuration for one composite executor.
///
/// At least one of `circuit_breaker` and `retry` must be present; an
/// executor built from neither is only valid when the call sites declare a
/// fallback through [`ResilienceExecutorBuilder::with_fallback`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Unique name of the protected dependency.
    pub name: String,

    /// Circuit breaker layer, when configured.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Retry layer, when configured.
    pub retry: Option<RetryConfig>,

    /// Overall timeout raced against the whole composed call.
    #[serde(with = "duration_millis_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ResilienceConfig {
    /// Create a configuration with the given name and no layers.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("resilience executor name must not be empty"));
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if self.circuit_breaker.is_none() && self.retry.is_none() {
            return Err(ConfigError::invalid(
                "configure a circuit breaker or a retry policy, or declare a fallback-only \
                 executor through the builder",
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Outcome of one composite call.
#[derive(Debug)]
pub struct ResilienceOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Final result of the call.
    pub result: ResilienceResult<T, E>,
    /// Wall-clock time spent in the call, fallback included.
    pub elapsed: Duration,
    /// Attempts made; 0 when the overall timeout preempted completion.
    pub total_attempts: u32,
    /// One record per failed-and-retried attempt.
    pub retries: Vec<RetryAttempt>,
    /// Whether the fallback produced (or tried to produce) the result.
    pub fallback_used: bool,
    /// Whether the overall timeout fired.
    pub timed_out: bool,
    /// Circuit breaker state after the call, when a breaker is configured.
    pub circuit_state: Option<CircuitState>,
}

impl<T, E> ResilienceOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }

    /// Whether the call ended in success (fallback included).
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Aggregated executor counters plus the breaker snapshot.
#[derive(Debug, Clone)]
pub struct ResilienceMetrics {
    /// Name of the protected dependency.
    pub name: String,
    /// Composite calls made.
    pub total_calls: u64,
    /// Calls that ended in success (fallback included).
    pub successful_calls: u64,
    /// Calls that ended in failure.
    pub failed_calls: u64,
    /// Calls where the fallback ran.
    pub fallback_calls: u64,
    /// Calls where the overall timeout fired.
    pub timed_out_calls: u64,
    /// Breaker snapshot, when a breaker is configured.
    pub circuit: Option<CircuitBreakerMetrics>,
}

/// Adapts the caller's retry policy to the error type produced by the
/// breaker layer: rejections and request timeouts are retryable (the
/// breaker may recover during backoff), operation failures defer to the
/// inner policy.
struct LayeredPolicy<'a, P> {
    inner: &'a P,
}

impl<P, E> RetryPolicy<ResilienceError<E>> for LayeredPolicy<'_, P>
where
    P: RetryPolicy<E>,
    E: std::error::Error + Send + Sync + 'static,
{
    fn should_retry(&self, error: &ResilienceError<E>, attempt: u32) -> RetryDecision {
        match error {
            ResilienceError::CircuitOpen { .. } | ResilienceError::Timeout { .. } => {
                RetryDecision::Retry
            }
            ResilienceError::OperationFailed { source }
            | ResilienceError::FallbackFailed { source } => self.inner.should_retry(source, attempt),
        }
    }
}

/// Composite executor: one instance per protected dependency, shared by
/// every caller that talks to it.
pub struct ResilienceExecutor<P = TransientRetry, C: Clock = SystemClock> {
    name: String,
    breaker: Option<CircuitBreaker<C>>,
    retry: Option<RetryConfig>,
    timeout: Option<Duration>,
    policy: P,
    on_retry: Option<RetryHook>,
    on_exhausted: Option<ExhaustedHook>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    fallback_calls: AtomicU64,
    timed_out_calls: AtomicU64,
}

impl ResilienceExecutor<TransientRetry, SystemClock> {
    /// Build an executor from a configuration record with the default
    /// transient-error retry policy.
    pub fn from_config(config: ResilienceConfig) -> ConfigResult<Self> {
        config.validate()?;
        let ResilienceConfig { name, circuit_breaker, retry, timeout } = config;
        let breaker = circuit_breaker.map(CircuitBreaker::new).transpose()?;
        Ok(Self {
            name,
            breaker,
            retry,
            timeout,
            policy: TransientRetry,
            on_retry: None,
            on_exhausted: None,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            fallback_calls: AtomicU64::new(0),
            timed_out_calls: AtomicU64::new(0),
        })
    }

    /// Create a builder for the named dependency.
    pub fn builder(name: impl Into<String>) -> ResilienceExecutorBuilder<TransientRetry, SystemClock> {
        ResilienceExecutorBuilder::new(name)
    }
}

impl<P, C: Clock> ResilienceExecutor<P, C> {
    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The circuit breaker layer, when configured.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker<C>> {
        self.breaker.as_ref()
    }

    /// Execute an operation through the configured layers, returning only
    /// the result.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation through the configured layers and return the
    /// full composite outcome.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> ResilienceOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.run_protected(operation).await;
        self.note(&outcome);
        outcome
    }

    /// Execute an operation through the configured layers, feeding the
    /// terminal error to an async fallback once every other layer is
    /// exhausted.
    pub async fn execute_with_fallback<F, Fut, T, E, FB, FbFut>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(&ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        let mut outcome = self.run_protected(operation).await;

        if let Err(error) = &outcome.result {
            debug!(executor = self.name.as_str(), %error, "invoking fallback");
            let fallback_started = Instant::now();
            outcome.result = match fallback(error).await {
                Ok(value) => Ok(value),
                Err(source) => {
                    warn!(executor = self.name.as_str(), "fallback failed");
                    Err(ResilienceError::FallbackFailed { source })
                }
            };
            outcome.fallback_used = true;
            outcome.elapsed += fallback_started.elapsed();
        }

        self.note(&outcome);
        outcome
    }

    /// Aggregated metrics snapshot; safe to call concurrently with
    /// in-flight executions.
    pub fn metrics(&self) -> ResilienceMetrics {
        ResilienceMetrics {
            name: self.name.clone(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            timed_out_calls: self.timed_out_calls.load(Ordering::Relaxed),
            circuit: self.breaker.as_ref().map(CircuitBreaker::metrics),
        }
    }

    /// Return the executor (and its breaker) to post-construction state.
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.fallback_calls.store(0, Ordering::Relaxed);
        self.timed_out_calls.store(0, Ordering::Relaxed);
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
    }

    async fn run_protected<F, Fut, T, E>(&self, operation: F) -> ResilienceOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();

        let layered = self.run_layers(operation);
        let (result, total_attempts, retries, timed_out) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, layered).await {
                Ok((result, attempts, retries)) => (result, attempts, retries, false),
                Err(_) => {
                    warn!(executor = self.name.as_str(), ?limit, "composite call timed out");
                    (Err(ResilienceError::Timeout { elapsed: limit }), 0, Vec::new(), true)
                }
            },
            None => {
                let (result, attempts, retries) = layered.await;
                (result, attempts, retries, false)
            }
        };

        ResilienceOutcome {
            result,
            elapsed: started.elapsed(),
            total_attempts,
            retries,
            fallback_used: false,
            timed_out,
            circuit_state: self.breaker.as_ref().map(CircuitBreaker::state),
        }
    }

    async fn run_layers<F, Fut, T, E>(
        &self,
        mut operation: F,
    ) -> (ResilienceResult<T, E>, u32, Vec<RetryAttempt>)
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match (&self.breaker, &self.retry) {
            (Some(breaker), Some(retry_config)) => {
                let retry = RetryExecutor::from_validated(
                    retry_config.clone(),
                    LayeredPolicy { inner: &self.policy },
                )
                .with_hooks(self.on_retry.clone(), self.on_exhausted.clone());

                // The operation is re-invoked per attempt; the RefCell lets
                // each attempt's future borrow it without a lending closure.
                let operation = RefCell::new(operation);
                let outcome = retry
                    .execute_with_outcome(|| async {
                        let attempt_future = {
                            let mut op = operation.borrow_mut();
                            (*op)()
                        };
                        breaker.execute(move || attempt_future).await
                    })
                    .await;

                let result = outcome.result.map_err(crate::retry::RetryError::into_source);
                (result, outcome.total_attempts, outcome.retries)
            }
            (Some(breaker), None) => {
                let result = breaker.execute(operation).await;
                (result, 1, Vec::new())
            }
            (None, Some(retry_config)) => {
                let retry =
                    RetryExecutor::from_validated(retry_config.clone(), &self.policy)
                        .with_hooks(self.on_retry.clone(), self.on_exhausted.clone());

                let operation = RefCell::new(operation);
                let outcome = retry
                    .execute_with_outcome(|| async {
                        let attempt_future = {
                            let mut op = operation.borrow_mut();
                            (*op)()
                        };
                        attempt_future.await
                    })
                    .await;

                let result = outcome
                    .result
                    .map_err(|error| ResilienceError::OperationFailed { source: error.into_source() });
                (result, outcome.total_attempts, outcome.retries)
            }
            (None, None) => {
                let result = operation()
                    .await
                    .map_err(|source| ResilienceError::OperationFailed { source });
                (result, 1, Vec::new())
            }
        }
    }

    fn note<T, E>(&self, outcome: &ResilienceOutcome<T, E>)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if outcome.timed_out {
            self.timed_out_calls.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.fallback_used {
            self.fallback_calls.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.result.is_ok() {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Builder wiring configuration, policies, hooks and the clock into a
/// [`ResilienceExecutor`].
pub struct ResilienceExecutorBuilder<P = TransientRetry, C: Clock = SystemClock> {
    name: String,
    breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
    timeout: Option<Duration>,
    policy: P,
    breaker_hooks: BreakerHooks,
    classifier: Option<FailureClassifier>,
    on_retry: Option<RetryHook>,
    on_exhausted: Option<ExhaustedHook>,
    fallback_expected: bool,
    clock: C,
}

impl ResilienceExecutorBuilder<TransientRetry, SystemClock> {
    /// Create a builder for the named dependency.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breaker: None,
            retry: None,
            timeout: None,
            policy: TransientRetry,
            breaker_hooks: BreakerHooks::default(),
            classifier: None,
            on_retry: None,
            on_exhausted: None,
            fallback_expected: false,
            clock: SystemClock,
        }
    }
}

impl<P, C: Clock> ResilienceExecutorBuilder<P, C> {
    /// Add a circuit breaker layer.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Add a retry layer.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Set the overall timeout raced against the whole composed call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare that call sites supply a fallback; permits building an
    /// executor with neither a circuit breaker nor a retry layer.
    pub fn with_fallback(mut self) -> Self {
        self.fallback_expected = true;
        self
    }

    /// Replace the retry classification policy.
    pub fn retry_policy<Q>(self, policy: Q) -> ResilienceExecutorBuilder<Q, C> {
        ResilienceExecutorBuilder {
            name: self.name,
            breaker: self.breaker,
            retry: self.retry,
            timeout: self.timeout,
            policy,
            breaker_hooks: self.breaker_hooks,
            classifier: self.classifier,
            on_retry: self.on_retry,
            on_exhausted: self.on_exhausted,
            fallback_expected: self.fallback_expected,
            clock: self.clock,
        }
    }

    /// Swap in a custom clock for the breaker layer (useful for testing).
    pub fn clock<D: Clock>(self, clock: D) -> ResilienceExecutorBuilder<P, D> {
        ResilienceExecutorBuilder {
            name: self.name,
            breaker: self.breaker,
            retry: self.retry,
            timeout: self.timeout,
            policy: self.policy,
            breaker_hooks: self.breaker_hooks,
            classifier: self.classifier,
            on_retry: self.on_retry,
            on_exhausted: self.on_exhausted,
            fallback_expected: self.fallback_expected,
            clock,
        }
    }

    /// Install the breaker's on-open hook.
    pub fn on_open(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.breaker_hooks.on_open = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the breaker's on-close hook.
    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.breaker_hooks.on_close = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the breaker's on-half-open hook.
    pub fn on_half_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.breaker_hooks.on_half_open = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the breaker's on-reject hook.
    pub fn on_reject(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.breaker_hooks.on_reject = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the retry layer's on-retry hook.
    pub fn on_retry(mut self, hook: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the retry layer's exhaustion hook.
    pub fn on_exhausted(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(std::sync::Arc::new(hook));
        self
    }

    /// Install the breaker's failure classifier.
    pub fn failure_when(
        mut self,
        is_failure: impl Fn(&dyn std::error::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(std::sync::Arc::new(is_failure));
        self
    }

    /// Validate the composition and build the executor.
    pub fn build(self) -> ConfigResult<ResilienceExecutor<P, C>> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("resilience executor name must not be empty"));
        }
        if self.breaker.is_none() && self.retry.is_none() && !self.fallback_expected {
            return Err(ConfigError::invalid(
                "configure a circuit breaker or a retry policy, or declare a fallback-only \
                 executor with with_fallback()",
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("timeout must be greater than 0"));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        let breaker = match self.breaker {
            Some(config) => Some(CircuitBreaker::assemble(
                config,
                self.breaker_hooks,
                self.classifier,
                self.clock,
            )?),
            None => None,
        };

        Ok(ResilienceExecutor {
            name: self.name,
            breaker,
            retry: self.retry,
            timeout: self.timeout,
            policy: self.policy,
            on_retry: self.on_retry,
            on_exhausted: self.on_exhausted,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            fallback_calls: AtomicU64::new(0),
            timed_out_calls: AtomicU64::new(0),
        })
    }
}
