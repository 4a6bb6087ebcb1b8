//! Retry executor with configurable backoff, jitter and retry policies

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::{BackoffStrategy, DelayCalculator, Jitter};
use crate::error::{ConfigError, ConfigResult};
use crate::serde_util::{duration_millis, duration_millis_opt};

/// Hook invoked before each retry sleep with the failed attempt number and
/// the chosen delay.
pub(crate) type RetryHook = Arc<dyn Fn(u32, Duration) + Send + Sync>;
/// Hook invoked once when every attempt has been used up.
pub(crate) type ExhaustedHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay fed into the backoff strategy.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Cap applied to the computed delay before jitter.
    #[serde(with = "duration_millis_opt", skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,

    /// How the delay grows between attempts.
    pub backoff: BackoffStrategy,

    /// Randomization applied to the computed delay.
    pub jitter: Jitter,

    /// Growth factor for linear and exponential backoff.
    pub multiplier: f64,

    /// Total time budget for the whole retry run; once exceeded, no further
    /// attempts are made.
    #[serde(with = "duration_millis_opt", skip_serializing_if = "Option::is_none")]
    pub max_total_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(30)),
            backoff: BackoffStrategy::Exponential,
            jitter: Jitter::Equal,
            multiplier: 2.0,
            max_total_time: Some(Duration::from_secs(300)),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if !(self.multiplier.is_finite() && self.multiplier > 0.0) {
            return Err(ConfigError::invalid("multiplier must be greater than 0"));
        }
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.base_delay {
                return Err(ConfigError::invalid(format!(
                    "max_delay ({:?}) cannot be less than base_delay ({:?})",
                    max_delay, self.base_delay
                )));
            }
        }
        Ok(())
    }

    /// Build a delay calculator for one retry run.
    pub fn delay_calculator(&self) -> DelayCalculator {
        DelayCalculator::new(
            self.backoff,
            self.base_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
        )
    }
}

/// Builder for [`RetryConfig`] with a fluent API; `build()` validates.
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Create a builder seeded with defaults.
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    /// Set the maximum number of attempts (including the first).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = Some(delay);
        self
    }

    /// Remove the delay cap.
    pub fn uncapped_delay(mut self) -> Self {
        self.config.max_delay = None;
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.config.backoff = strategy;
        self
    }

    /// Set the growth multiplier for linear/exponential backoff.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Disable jitter.
    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    /// Use full jitter.
    pub fn full_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Full;
        self
    }

    /// Use equal jitter.
    pub fn equal_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Equal;
        self
    }

    /// Use decorrelated jitter.
    pub fn decorrelated_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Decorrelated;
        self
    }

    /// Set the total time budget for a retry run.
    pub fn max_total_time(mut self, budget: Duration) -> Self {
        self.config.max_total_time = Some(budget);
        self
    }

    /// Remove the total time budget.
    pub fn unlimited_time(mut self) -> Self {
        self.config.max_total_time = None;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Decision for whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry with the configured backoff delay.
    Retry,
    /// Retry after a custom delay.
    RetryAfter(Duration),
    /// Don't retry the operation.
    Stop,
}

/// Trait for deciding whether a failed operation should be retried.
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub trait RetryPolicy<E> {
    /// Classify the error and decide whether to retry.
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

impl<E, P> RetryPolicy<E> for &P
where
    P: RetryPolicy<E>,
{
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
        (**self).should_retry(error, attempt)
    }
}

/// Pre-defined retry policies for common scenarios.
pub mod policies {
    use super::{RetryDecision, RetryPolicy};
    use crate::profiles;

    /// Default classifier: retries unless the error looks permanent.
    ///
    /// Uses [`profiles::is_transient_error`] so client errors (bad request,
    /// unauthorized, not found, validation failures) stop the loop while
    /// everything else is treated as transient.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TransientRetry;

    impl<E> RetryPolicy<E> for TransientRetry
    where
        E: std::error::Error,
    {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if profiles::is_transient_error(error) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Retries on any error.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retries.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy over `(error, attempt)`.
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        /// Wrap a predicate; `true` means retry.
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

/// One failed-and-retried attempt, recorded into the outcome.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based number of the failed attempt.
    pub attempt: u32,
    /// Delay slept before the next attempt.
    pub delay: Duration,
    /// Time elapsed since the run started when the attempt failed.
    pub elapsed: Duration,
    /// Description of the error that triggered the retry.
    pub error: String,
}

/// Errors that terminate a retry run.
///
/// Every variant carries the last underlying error so callers never receive
/// an opaque wrapper; [`RetryError::into_source`] recovers it verbatim.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts were used up.
    #[error("all {attempts} retry attempts exhausted: {source}")]
    AttemptsExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: E,
    },

    /// The policy classified the error as non-retryable.
    #[error("non-retryable error: {source}")]
    NonRetryable {
        /// The non-retryable error.
        #[source]
        source: E,
    },

    /// The total time budget ran out before the attempts did.
    #[error("retry time budget exceeded after {elapsed:?}: {source}")]
    TimeBudgetExceeded {
        /// Elapsed time when the run was abandoned.
        elapsed: Duration,
        /// The error from the most recent attempt.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Recover the last underlying error.
    pub fn into_source(self) -> E {
        match self {
            Self::AttemptsExhausted { source, .. }
            | Self::NonRetryable { source }
            | Self::TimeBudgetExceeded { source, .. } => source,
        }
    }
}

/// Result type for retry runs.
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry run including the result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result of the run.
    pub result: RetryResult<T, E>,
    /// Total attempts made, including the final one.
    pub total_attempts: u32,
    /// Wall-clock time from first attempt to completion.
    pub elapsed: Duration,
    /// Sum of all inter-attempt delays.
    pub total_delay: Duration,
    /// Whether the run was abandoned because the time budget ran out.
    pub timed_out: bool,
    /// One record per failed-and-retried attempt (the terminal attempt is
    /// not recorded).
    pub retries: Vec<RetryAttempt>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Whether the run ended in success.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Average delay between attempts, when any retries happened.
    pub fn average_delay(&self) -> Option<Duration> {
        let retries = u32::try_from(self.retries.len()).ok()?;
        if retries == 0 {
            None
        } else {
            Some(self.total_delay / retries)
        }
    }
}

/// The retry executor: repeats an operation until success, a non-retryable
/// error, attempt-budget exhaustion or total-time-budget exhaustion.
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
    on_retry: Option<RetryHook>,
    on_exhausted: Option<ExhaustedHook>,
}

impl<P> RetryExecutor<P> {
    /// Create a new executor; the configuration is validated eagerly.
    pub fn new(config: RetryConfig, policy: P) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, policy))
    }

    /// Create an executor with the default configuration.
    pub fn with_policy(policy: P) -> Self {
        Self::from_validated(RetryConfig::default(), policy)
    }

    pub(crate) fn from_validated(config: RetryConfig, policy: P) -> Self {
        Self { config, policy, on_retry: None, on_exhausted: None }
    }

    pub(crate) fn with_hooks(
        mut self,
        on_retry: Option<RetryHook>,
        on_exhausted: Option<ExhaustedHook>,
    ) -> Self {
        self.on_retry = on_retry;
        self.on_exhausted = on_exhausted;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Install a hook fired before each retry sleep with the failed attempt
    /// number and the chosen delay.
    pub fn on_retry(mut self, hook: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Install a hook fired once when every attempt has been used up.
    pub fn on_exhausted(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Arc::new(hook));
        self
    }

    /// Execute an operation with retry logic.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation with retry logic and return the full outcome.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut calculator = self.config.delay_calculator();
        let mut retries: Vec<RetryAttempt> = Vec::new();
        let mut total_delay = Duration::ZERO;
        let mut attempt: u32 = 1;

        loop {
            debug!(attempt, max_attempts = self.config.max_attempts, "executing attempt");

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        total_attempts: attempt,
                        elapsed: started.elapsed(),
                        total_delay,
                        timed_out: false,
                        retries,
                    };
                }
                Err(error) => error,
            };

            let described = format!("{error:?}");
            let decision = self.policy.should_retry(&error, attempt);

            if decision == RetryDecision::Stop {
                debug!(attempt, error = described.as_str(), "error is not retryable");
                return RetryOutcome {
                    result: Err(RetryError::NonRetryable { source: error }),
                    total_attempts: attempt,
                    elapsed: started.elapsed(),
                    total_delay,
                    timed_out: false,
                    retries,
                };
            }

            let elapsed = started.elapsed();
            if let Some(budget) = self.config.max_total_time {
                if elapsed >= budget {
                    warn!(attempt, ?elapsed, "retry time budget exhausted");
                    return RetryOutcome {
                        result: Err(RetryError::TimeBudgetExceeded { elapsed, source: error }),
                        total_attempts: attempt,
                        elapsed,
                        total_delay,
                        timed_out: true,
                        retries,
                    };
                }
            }

            if attempt >= self.config.max_attempts {
                warn!(attempts = attempt, error = described.as_str(), "all retry attempts failed");
                if let Some(hook) = &self.on_exhausted {
                    hook(attempt);
                }
                return RetryOutcome {
                    result: Err(RetryError::AttemptsExhausted { attempts: attempt, source: error }),
                    total_attempts: attempt,
                    elapsed: started.elapsed(),
                    total_delay,
                    timed_out: false,
                    retries,
                };
            }

            let delay = match decision {
                RetryDecision::RetryAfter(custom) => custom,
                _ => calculator.delay_for(attempt),
            };

            warn!(attempt, ?delay, error = described.as_str(), "attempt failed, backing off");
            retries.push(RetryAttempt { attempt, delay, elapsed, error: described });
            if let Some(hook) = &self.on_retry {
                hook(attempt, delay);
            }

            tokio::time::sleep(delay).await;
            total_delay += delay;
            attempt += 1;
        }
    }
}

/// Convenience function: execute an operation with the given configuration
/// and policy.
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> ConfigResult<RetryResult<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    let executor = RetryExecutor::new(config, policy)?;
    Ok(executor.execute(operation).await)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::policies::{AlwaysRetry, NeverRetry, PredicateRetry};
    use super::*;

    #[derive(Debug, Clone)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(1))
            .backoff(BackoffStrategy::Fixed)
            .no_jitter()
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RetryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.jitter, Jitter::Equal);
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let result = RetryConfig::builder().max_attempts(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_bad_multiplier() {
        assert!(RetryConfig::builder().multiplier(0.0).build().is_err());
        assert!(RetryConfig::builder().multiplier(-1.0).build().is_err());
    }

    #[test]
    fn test_builder_rejects_max_delay_below_base() {
        let result = RetryConfig::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(5))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = RetryConfig::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(250))
            .max_delay(Duration::from_secs(10))
            .decorrelated_jitter()
            .build()
            .expect("valid config");

        let json = serde_json::to_string(&config).expect("serialize");
        let back: RetryConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.max_attempts, 5);
        assert_eq!(back.base_delay, Duration::from_millis(250));
        assert_eq!(back.max_delay, Some(Duration::from_secs(10)));
        assert_eq!(back.jitter, Jitter::Decorrelated);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let executor = RetryExecutor::new(fast_config(5), AlwaysRetry).expect("valid config");

        let outcome = executor
            .execute_with_outcome(|| {
                let c = Arc::clone(&counter_clone);
                async move {
                    let count = c.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(TestError("transient".to_string()))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.total_attempts, 3);
        assert_eq!(outcome.retries.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    /// Three attempts against an always-failing operation: the outcome
    /// reports three attempts but only the two retried ones are logged.
    #[tokio::test]
    async fn test_attempts_exhausted_logs_only_retried_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let executor = RetryExecutor::new(fast_config(3), AlwaysRetry).expect("valid config");

        let outcome = executor
            .execute_with_outcome(|| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("persistent".to_string()))
                }
            })
            .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.total_attempts, 3);
        assert_eq!(outcome.retries.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        match outcome.result {
            Err(RetryError::AttemptsExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.0, "persistent");
            }
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let executor = RetryExecutor::new(fast_config(5), NeverRetry).expect("valid config");

        let result = executor
            .execute(|| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("fatal".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_time_budget_stops_the_run() {
        let config = RetryConfig::builder()
            .max_attempts(100)
            .base_delay(Duration::from_millis(20))
            .backoff(BackoffStrategy::Fixed)
            .no_jitter()
            .max_total_time(Duration::from_millis(50))
            .build()
            .expect("valid config");

        let executor = RetryExecutor::new(config, AlwaysRetry).expect("valid config");

        let outcome = executor
            .execute_with_outcome(|| async { Err::<(), _>(TestError("slow".to_string())) })
            .await;

        assert!(outcome.timed_out);
        assert!(matches!(outcome.result, Err(RetryError::TimeBudgetExceeded { .. })));
        assert!(outcome.total_attempts < 100);
    }

    #[tokio::test]
    async fn test_predicate_policy_stops_on_attempt_limit() {
        let policy =
            PredicateRetry::new(|error: &TestError, attempt| error.0.contains("retry") && attempt < 2);
        let executor = RetryExecutor::new(fast_config(5), policy).expect("valid config");

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = executor
            .execute(|| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("retry me".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // Attempt 1 retries, attempt 2 is rejected by the predicate.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exponential_delays_double_between_attempts() {
        let config = RetryConfig::builder()
            .max_attempts(4)
            .base_delay(Duration::from_millis(10))
            .backoff(BackoffStrategy::Exponential)
            .multiplier(2.0)
            .no_jitter()
            .build()
            .expect("valid config");

        let executor = RetryExecutor::new(config, AlwaysRetry).expect("valid config");

        let outcome = executor
            .execute_with_outcome(|| async { Err::<(), _>(TestError("down".to_string())) })
            .await;

        let delays: Vec<Duration> = outcome.retries.iter().map(|r| r.delay).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
    }

    #[tokio::test]
    async fn test_custom_delay_decision_is_honored() {
        struct FixedPause;
        impl RetryPolicy<TestError> for FixedPause {
            fn should_retry(&self, _error: &TestError, _attempt: u32) -> RetryDecision {
                RetryDecision::RetryAfter(Duration::from_millis(2))
            }
        }

        let executor = RetryExecutor::new(fast_config(3), FixedPause).expect("valid config");

        let outcome = executor
            .execute_with_outcome(|| async { Err::<(), _>(TestError("slow".to_string())) })
            .await;

        assert_eq!(outcome.retries.len(), 2);
        for retry in &outcome.retries {
            assert_eq!(retry.delay, Duration::from_millis(2));
        }
    }

    #[tokio::test]
    async fn test_hooks_fire_on_retry_and_exhaustion() {
        let retry_count = Arc::new(AtomicU32::new(0));
        let exhausted_attempts = Arc::new(AtomicU32::new(0));
        let retry_clone = Arc::clone(&retry_count);
        let exhausted_clone = Arc::clone(&exhausted_attempts);

        let executor = RetryExecutor::new(fast_config(3), AlwaysRetry)
            .expect("valid config")
            .on_retry(move |_attempt, _delay| {
                retry_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_exhausted(move |attempts| {
                exhausted_clone.store(attempts, Ordering::SeqCst);
            });

        let result = executor
            .execute(|| async { Err::<(), _>(TestError("down".to_string())) })
            .await;

        assert!(result.is_err());
        assert_eq!(retry_count.load(Ordering::SeqCst), 2);
        assert_eq!(exhausted_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_policy_convenience() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_policy(fast_config(2), AlwaysRetry, || {
            let c = Arc::clone(&counter_clone);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError("first fails".to_string()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .expect("valid config");

        assert_eq!(result.expect("should succeed"), "ok");
    }

    #[test]
    fn test_retry_error_exposes_source() {
        let err = RetryError::AttemptsExhausted {
            attempts: 4,
            source: TestError("last".to_string()),
        };
        assert!(err.to_string().contains("4 retry attempts"));
        assert_eq!(err.into_source().0, "last");
    }
}
