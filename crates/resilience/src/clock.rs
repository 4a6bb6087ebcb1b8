//! Time abstraction for deterministic testing
//!
//! Circuit breakers make decisions based on elapsed time (sliding failure
//! windows, recovery timeouts). This module lets them use real monotonic
//! time in production and controlled mock time in tests, so timeout-based
//! behavior can be asserted without actual delays.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Trait for reading monotonic time.
pub trait Clock: Send + Sync + 'static {
    /// Get the current instant (monotonic time).
    fn now(&self) -> Instant;
}

/// Real system clock implementation for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Implement Clock for Arc<T> where T: Clock for convenient sharing.
impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Mock clock for deterministic testing.
///
/// Clones share the same elapsed counter, so a test can hold one handle
/// while the component under test holds another and both observe the same
/// simulated time.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant.
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Advance the mock clock by milliseconds (convenience method).
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the mock clock to a specific elapsed time.
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    /// Get the current elapsed time.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock()
    }
}
