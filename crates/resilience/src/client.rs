//! Service wrapper routing every call through a shared executor
//!
//! [`ResilientClient`] wraps a client value (an HTTP client, a database
//! handle, an SDK facade) so that each call goes through one shared
//! [`ResilienceExecutor`] for that dependency. Calls are expressed as
//! closures over `&S`, so receiver binding, method identity and arity are
//! preserved; non-callable members pass through unchanged via `Deref` or
//! [`ResilientClient::service`].

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, ResilienceResult};
use crate::executor::{ResilienceExecutor, ResilienceOutcome};
use crate::retry::policies::TransientRetry;
use crate::retry::RetryPolicy;

/// A client whose calls are protected by a shared [`ResilienceExecutor`].
pub struct ResilientClient<S, P = TransientRetry, C: Clock = SystemClock> {
    service: S,
    executor: Arc<ResilienceExecutor<P, C>>,
}

impl<S, P, C: Clock> ResilientClient<S, P, C> {
    /// Wrap a service value with the given executor.
    pub fn new(service: S, executor: Arc<ResilienceExecutor<P, C>>) -> Self {
        Self { service, executor }
    }

    /// The wrapped service value.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Unwrap the service value.
    pub fn into_service(self) -> S {
        self.service
    }

    /// The shared executor protecting this client.
    pub fn executor(&self) -> &ResilienceExecutor<P, C> {
        &self.executor
    }

    /// Route one call of the wrapped service through the executor.
    ///
    /// The closure may be invoked several times (once per retry attempt);
    /// it receives `&S` so calls go through the real receiver.
    pub async fn call<'a, T, E, F, Fut>(
        &'a self,
        operation_name: &str,
        f: F,
    ) -> ResilienceResult<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&'a S) -> Fut,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        debug!(client = self.executor.name(), operation = operation_name, "protected call");
        self.executor.execute(|| f(&self.service)).await
    }

    /// Like [`ResilientClient::call`], returning the full composite
    /// outcome.
    pub async fn call_with_outcome<'a, T, E, F, Fut>(
        &'a self,
        operation_name: &str,
        f: F,
    ) -> ResilienceOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&'a S) -> Fut,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        debug!(client = self.executor.name(), operation = operation_name, "protected call");
        self.executor.execute_with_outcome(|| f(&self.service)).await
    }

    /// Like [`ResilientClient::call`], with an async fallback fed the
    /// terminal error.
    pub async fn call_with_fallback<'a, T, E, F, Fut, FB, FbFut>(
        &'a self,
        operation_name: &str,
        f: F,
        fallback: FB,
    ) -> ResilienceOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&'a S) -> Fut,
        Fut: Future<Output = Result<T, E>> + 'a,
        FB: FnOnce(&ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        debug!(client = self.executor.name(), operation = operation_name, "protected call");
        self.executor.execute_with_fallback(|| f(&self.service), fallback).await
    }
}

impl<S, P, C: Clock> Deref for ResilientClient<S, P, C> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.service
    }
}

impl<S: std::fmt::Debug, P, C: Clock> std::fmt::Debug for ResilientClient<S, P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("service", &self.service)
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl<S: Clone, P, C: Clock> Clone for ResilientClient<S, P, C> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone(), executor: Arc::clone(&self.executor) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffStrategy;
    use crate::retry::policies::AlwaysRetry;
    use crate::retry::RetryConfig;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(String);

    #[derive(Debug)]
    struct FakeApi {
        pub endpoint: &'static str,
        calls: AtomicU32,
    }

    impl FakeApi {
        fn new() -> Self {
            Self { endpoint: "https://api.example.test", calls: AtomicU32::new(0) }
        }

        async fn fetch_status(&self) -> Result<&'static str, TestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err(TestError("503 service unavailable".to_string()))
            } else {
                Ok("healthy")
            }
        }
    }

    fn retry_executor() -> Arc<ResilienceExecutor<AlwaysRetry>> {
        let config = RetryConfig::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(1))
            .backoff(BackoffStrategy::Fixed)
            .no_jitter()
            .build()
            .expect("valid config");

        Arc::new(
            ResilienceExecutor::builder("fake-api")
                .retry(config)
                .retry_policy(AlwaysRetry)
                .build()
                .expect("valid executor"),
        )
    }

    #[tokio::test]
    async fn test_call_retries_through_the_shared_executor() {
        let client = ResilientClient::new(FakeApi::new(), retry_executor());

        let status = client
            .call("fetch_status", |api| api.fetch_status())
            .await
            .expect("second attempt succeeds");

        assert_eq!(status, "healthy");
        assert_eq!(client.service().calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.executor().metrics().total_calls, 1);
    }

    #[tokio::test]
    async fn test_non_callable_members_pass_through() {
        let client = ResilientClient::new(FakeApi::new(), retry_executor());

        // Deref exposes plain fields of the wrapped service unchanged.
        assert_eq!(client.endpoint, "https://api.example.test");
        assert_eq!(client.service().endpoint, "https://api.example.test");
    }

    #[tokio::test]
    async fn test_call_with_outcome_reports_attempts() {
        let client = ResilientClient::new(FakeApi::new(), retry_executor());

        let outcome = client
            .call_with_outcome("fetch_status", |api| api.fetch_status())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.total_attempts, 2);
        assert_eq!(outcome.retries.len(), 1);
    }

    #[tokio::test]
    async fn test_into_service_unwraps() {
        let client = ResilientClient::new(FakeApi::new(), retry_executor());
        let api = client.into_service();
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }
}
