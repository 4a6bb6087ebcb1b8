//! Circuit breaker state machine with a sliding failure window
//!
//! The breaker guards a single logical dependency. It counts qualifying
//! failures inside a sliding time window while `Closed`, opens once the
//! threshold is reached, rejects calls until the recovery timeout elapses,
//! then admits probe calls in `HalfOpen` until enough successes close it
//! again (or any failure re-opens it).
//!
//! Concurrent calls during `HalfOpen` are all admitted; there is no
//! single-probe limiting, so several racing failures can each observe the
//! re-open transition. State, failure log and counters live behind one
//! mutex and commit atomically; lifecycle hooks fire after the lock is
//! released, so a hook may call back into the breaker without deadlocking.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::serde_util::{duration_millis, duration_millis_opt};

/// Minimum accepted sliding window and recovery timeout.
const MIN_TIMING: Duration = Duration::from_millis(1000);

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through normally.
    Closed,
    /// Requests are rejected without invoking the operation.
    Open,
    /// Probe requests are admitted to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Unique name of the guarded dependency.
    pub name: String,

    /// Number of qualifying failures within the window before opening.
    pub failure_threshold: u32,

    /// Sliding time window over which failures count toward the threshold.
    #[serde(with = "duration_millis")]
    pub failure_window: Duration,

    /// Time to wait while open before admitting a probe call.
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,

    /// Successes needed in half-open state before closing.
    pub success_threshold: u32,

    /// Per-call timeout raced against the operation; a timeout counts as an
    /// ordinary failure at this layer.
    #[serde(with = "duration_millis_opt", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            request_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with the given dependency name and defaults
    /// for everything else.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("circuit breaker name must not be empty"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be at least 1"));
        }
        if self.failure_window < MIN_TIMING {
            return Err(ConfigError::invalid(format!(
                "failure_window must be at least {MIN_TIMING:?}"
            )));
        }
        if self.recovery_timeout < MIN_TIMING {
            return Err(ConfigError::invalid(format!(
                "recovery_timeout must be at least {MIN_TIMING:?}"
            )));
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("request_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// One failure observed by the breaker; append-only, pruned lazily against
/// the sliding window on read and write.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// When the failure happened.
    pub at: Instant,
    /// Description of the error.
    pub error: String,
    /// Name of the operation that failed, when the caller supplied one.
    pub operation: Option<String>,
}

/// Read-only snapshot of a breaker's counters, computed on demand.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Name of the guarded dependency.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Calls seen, including rejected ones.
    pub total_requests: u64,
    /// Calls whose operation succeeded.
    pub successful_requests: u64,
    /// Calls whose operation failed (counted or not).
    pub failed_requests: u64,
    /// Calls rejected while open.
    pub rejected_requests: u64,
    /// Qualifying failures currently inside the sliding window.
    pub current_failure_count: u32,
    /// failed / total, zero when no calls were made.
    pub failure_rate: f64,
    /// successful / total, zero when no calls were made.
    pub success_rate: f64,
    /// When the breaker last opened.
    pub last_opened_at: Option<Instant>,
    /// When the breaker last closed after a recovery.
    pub last_closed_at: Option<Instant>,
    /// When the breaker will next admit a probe call.
    pub next_probe_at: Option<Instant>,
}

pub(crate) type StateHook = Arc<dyn Fn() + Send + Sync>;
pub(crate) type OpenHook = Arc<dyn Fn(u32) + Send + Sync>;
pub(crate) type FailureClassifier = Arc<dyn Fn(&dyn std::error::Error) -> bool + Send + Sync>;

/// Lifecycle hooks, fired synchronously once the transition has committed
/// and the state lock has been released.
#[derive(Clone, Default)]
pub(crate) struct BreakerHooks {
    pub(crate) on_open: Option<OpenHook>,
    pub(crate) on_close: Option<StateHook>,
    pub(crate) on_half_open: Option<StateHook>,
    pub(crate) on_reject: Option<StateHook>,
}

/// Transition and rejection events collected under the lock, fired after.
enum BreakerEvent {
    Opened(u32),
    Closed,
    HalfOpened,
    Rejected,
}

struct BreakerInner {
    state: CircuitState,
    failures: Vec<FailureRecord>,
    success_streak: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    last_closed_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: Vec::new(),
            success_streak: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            opened_at: None,
            next_probe_at: None,
            last_closed_at: None,
        }
    }
}

/// Detailed result of one call through the breaker.
#[derive(Debug)]
pub struct BreakerReport<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Outcome of the call.
    pub result: ResilienceResult<T, E>,
    /// Breaker state after the call completed.
    pub state: CircuitState,
    /// Whether the call was rejected without invoking the operation.
    pub rejected: bool,
    /// Wall-clock time spent in the call.
    pub elapsed: Duration,
}

impl<T, E> BreakerReport<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the report and return only the result.
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }
}

/// Thread-safe circuit breaker guarding one logical dependency.
///
/// Clones share state, so a breaker can be handed to several tasks while
/// remaining a single decision point for its dependency.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    hooks: BreakerHooks,
    classifier: Option<FailureClassifier>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            hooks: self.hooks.clone(),
            classifier: self.classifier.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new breaker; the configuration is validated eagerly.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a breaker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default()).expect("default circuit breaker config is valid")
    }

    /// Create a builder for hooks, failure classification and clock wiring.
    pub fn builder() -> CircuitBreakerBuilder<SystemClock> {
        CircuitBreakerBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing).
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        Self::assemble(config, BreakerHooks::default(), None, clock)
    }

    pub(crate) fn assemble(
        config: CircuitBreakerConfig,
        hooks: BreakerHooks,
        classifier: Option<FailureClassifier>,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner::new())),
            hooks,
            classifier,
            clock: Arc::new(clock),
        })
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state, applying the lazy open-to-half-open transition.
    pub fn state(&self) -> CircuitState {
        let (state, events) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            self.poll_recovery(&mut inner, &mut events);
            (inner.state, events)
        };
        self.fire(&events);
        state
    }

    /// Whether a call would currently be admitted.
    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Execute an operation under the breaker, returning only the result.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(None, operation).await.into_result()
    }

    /// Execute a named operation under the breaker; the name is recorded in
    /// failure log entries.
    pub async fn execute_named<F, Fut, T, E>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(Some(operation_name), operation).await.into_result()
    }

    /// Execute an operation under the breaker, returning the detailed
    /// report (state after the call, rejection flag, elapsed time).
    pub async fn execute_with_report<F, Fut, T, E>(&self, operation: F) -> BreakerReport<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(None, operation).await
    }

    async fn run<F, Fut, T, E>(&self, operation_name: Option<&str>, operation: F) -> BreakerReport<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = self.clock.now();

        // Admission check: reject while open, lazily move to half-open once
        // the recovery timeout has elapsed.
        let rejection = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            inner.total_requests += 1;
            self.poll_recovery(&mut inner, &mut events);

            if inner.state == CircuitState::Open {
                inner.rejected_requests += 1;
                let retry_in = inner
                    .next_probe_at
                    .map(|at| at.saturating_duration_since(self.clock.now()))
                    .unwrap_or_default();
                events.push(BreakerEvent::Rejected);
                Some((retry_in, events))
            } else {
                drop(inner);
                self.fire(&events);
                None
            }
        };

        if let Some((retry_in, events)) = rejection {
            self.fire(&events);
            debug!(breaker = self.config.name.as_str(), ?retry_in, "rejecting call while open");
            return BreakerReport {
                result: Err(ResilienceError::CircuitOpen {
                    name: self.config.name.clone(),
                    retry_in,
                }),
                state: CircuitState::Open,
                rejected: true,
                elapsed: self.clock.now().saturating_duration_since(started),
            };
        }

        // Run the operation, racing the per-call timeout when configured.
        let outcome: ResilienceResult<T, E> = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(|source| ResilienceError::OperationFailed { source }),
                Err(_) => Err(ResilienceError::Timeout { elapsed: limit }),
            },
            None => operation().await.map_err(|source| ResilienceError::OperationFailed { source }),
        };

        let state = match &outcome {
            Ok(_) => self.note_success(),
            Err(error) => {
                // A caller-supplied classifier can exempt errors from the
                // breaker; timeouts always count.
                let counted = match error {
                    ResilienceError::OperationFailed { source } => {
                        self.classifier.as_ref().map_or(true, |is_failure| is_failure(source))
                    }
                    _ => true,
                };
                self.note_failure(error.to_string(), operation_name, counted)
            }
        };

        BreakerReport {
            result: outcome,
            state,
            rejected: false,
            elapsed: self.clock.now().saturating_duration_since(started),
        }
    }

    /// Record a successful operation observed outside `execute`.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        drop(inner);
        self.note_success();
    }

    /// Record a failed operation observed outside `execute`.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        drop(inner);
        self.note_failure("unclassified failure".to_string(), None, true);
    }

    fn note_success(&self) -> CircuitState {
        let (state, events) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            self.poll_recovery(&mut inner, &mut events);
            inner.successful_requests += 1;
            self.prune(&mut inner);

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_streak += 1;
                    if inner.success_streak >= self.config.success_threshold {
                        self.transition_to_closed(&mut inner, &mut events);
                    }
                }
                CircuitState::Closed => {}
                CircuitState::Open => {
                    warn!(
                        breaker = self.config.name.as_str(),
                        "success observed while open"
                    );
                }
            }
            (inner.state, events)
        };
        self.fire(&events);
        state
    }

    fn note_failure(
        &self,
        description: String,
        operation_name: Option<&str>,
        counted: bool,
    ) -> CircuitState {
        let (state, events) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            self.poll_recovery(&mut inner, &mut events);
            inner.failed_requests += 1;

            if counted {
                inner.failures.push(FailureRecord {
                    at: self.clock.now(),
                    error: description,
                    operation: operation_name.map(str::to_string),
                });
                self.prune(&mut inner);

                match inner.state {
                    CircuitState::Closed => {
                        let window_failures = inner.failures.len() as u32;
                        if window_failures >= self.config.failure_threshold {
                            self.transition_to_open(&mut inner, &mut events, window_failures);
                        }
                    }
                    CircuitState::HalfOpen => {
                        let window_failures = inner.failures.len() as u32;
                        self.transition_to_open(&mut inner, &mut events, window_failures);
                    }
                    CircuitState::Open => {}
                }
            }
            (inner.state, events)
        };
        self.fire(&events);
        state
    }

    /// Read-only metrics snapshot; safe to call concurrently with in-flight
    /// executions.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (snapshot, events) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            self.poll_recovery(&mut inner, &mut events);
            self.prune(&mut inner);

            let total = inner.total_requests;
            let rate = |count: u64| if total == 0 { 0.0 } else { count as f64 / total as f64 };
            let snapshot = CircuitBreakerMetrics {
                name: self.config.name.clone(),
                state: inner.state,
                total_requests: total,
                successful_requests: inner.successful_requests,
                failed_requests: inner.failed_requests,
                rejected_requests: inner.rejected_requests,
                current_failure_count: inner.failures.len() as u32,
                failure_rate: rate(inner.failed_requests),
                success_rate: rate(inner.successful_requests),
                last_opened_at: inner.opened_at,
                last_closed_at: inner.last_closed_at,
                next_probe_at: inner.next_probe_at,
            };
            (snapshot, events)
        };
        self.fire(&events);
        snapshot
    }

    /// Qualifying failures currently inside the sliding window, newest
    /// last.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        let mut inner = self.inner.lock();
        self.prune(&mut inner);
        inner.failures.clone()
    }

    /// Return the breaker to its exact post-construction state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
        info!(breaker = self.config.name.as_str(), "circuit breaker reset");
    }

    fn poll_recovery(&self, inner: &mut BreakerInner, events: &mut Vec<BreakerEvent>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner.next_probe_at.is_some_and(|at| self.clock.now() >= at);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.success_streak = 0;
            events.push(BreakerEvent::HalfOpened);
            info!(breaker = self.config.name.as_str(), "circuit breaker half-open, probing");
        }
    }

    fn transition_to_open(
        &self,
        inner: &mut BreakerInner,
        events: &mut Vec<BreakerEvent>,
        window_failures: u32,
    ) {
        let now = self.clock.now();
        inner.state = CircuitState::Open;
        inner.success_streak = 0;
        inner.opened_at = Some(now);
        inner.next_probe_at = Some(now + self.config.recovery_timeout);
        events.push(BreakerEvent::Opened(window_failures));
        warn!(
            breaker = self.config.name.as_str(),
            window_failures,
            recovery_timeout = ?self.config.recovery_timeout,
            "circuit breaker opened"
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner, events: &mut Vec<BreakerEvent>) {
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.success_streak = 0;
        inner.last_closed_at = Some(self.clock.now());
        events.push(BreakerEvent::Closed);
        info!(breaker = self.config.name.as_str(), "circuit breaker closed after recovery");
    }

    fn prune(&self, inner: &mut BreakerInner) {
        if let Some(cutoff) = self.clock.now().checked_sub(self.config.failure_window) {
            inner.failures.retain(|record| record.at > cutoff);
        }
    }

    fn fire(&self, events: &[BreakerEvent]) {
        for event in events {
            match event {
                BreakerEvent::Opened(failures) => {
                    if let Some(hook) = &self.hooks.on_open {
                        hook(*failures);
                    }
                }
                BreakerEvent::Closed => {
                    if let Some(hook) = &self.hooks.on_close {
                        hook();
                    }
                }
                BreakerEvent::HalfOpened => {
                    if let Some(hook) = &self.hooks.on_half_open {
                        hook();
                    }
                }
                BreakerEvent::Rejected => {
                    if let Some(hook) = &self.hooks.on_reject {
                        hook();
                    }
                }
            }
        }
    }
}

/// Builder wiring configuration, lifecycle hooks, the failure classifier
/// and the clock into a [`CircuitBreaker`].
pub struct CircuitBreakerBuilder<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    hooks: BreakerHooks,
    classifier: Option<FailureClassifier>,
    clock: C,
}

impl Default for CircuitBreakerBuilder<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerBuilder<SystemClock> {
    /// Create a builder seeded with defaults and the system clock.
    pub fn new() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            hooks: BreakerHooks::default(),
            classifier: None,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> CircuitBreakerBuilder<C> {
    /// Set the dependency name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Start from an existing configuration record.
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set the sliding failure window.
    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = window;
        self
    }

    /// Set the recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Set the success threshold for closing from half-open.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set the per-call request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Install a hook fired when the breaker opens, with the number of
    /// window failures that tripped it.
    pub fn on_open(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hooks.on_open = Some(Arc::new(hook));
        self
    }

    /// Install a hook fired when the breaker closes.
    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    /// Install a hook fired when the breaker transitions to half-open.
    pub fn on_half_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_half_open = Some(Arc::new(hook));
        self
    }

    /// Install a hook fired when a call is rejected while open.
    pub fn on_reject(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_reject = Some(Arc::new(hook));
        self
    }

    /// Install a failure classifier; errors for which it returns `false`
    /// are returned to the caller without counting toward the breaker.
    pub fn failure_when(
        mut self,
        is_failure: impl Fn(&dyn std::error::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(is_failure));
        self
    }

    /// Swap in a custom clock (useful for testing).
    pub fn clock<D: Clock>(self, clock: D) -> CircuitBreakerBuilder<D> {
        CircuitBreakerBuilder {
            config: self.config,
            hooks: self.hooks,
            classifier: self.classifier,
            clock,
        }
    }

    /// Validate the configuration and build the breaker.
    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::assemble(self.config, self.hooks, self.classifier, self.clock)
    }
}
