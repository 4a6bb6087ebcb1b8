//! Backoff strategies and jitter for retry delays

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Strategy for growing the delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay: `base_delay` for every attempt.
    Fixed,
    /// Linear growth: `base_delay * attempt * multiplier`.
    Linear,
    /// Exponential growth: `base_delay * multiplier^(attempt - 1)`.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Randomization applied to a computed delay to avoid synchronized retry
/// storms across callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter, the computed delay is used as-is.
    None,
    /// Full jitter: uniform in `[0, delay]`.
    Full,
    /// Equal jitter: `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
    /// Decorrelated jitter: uniform in `[previous_delay, delay * 3]`.
    ///
    /// The previous-delay state lives in the [`DelayCalculator`] and is
    /// reset at the start of each retry run.
    Decorrelated,
}

impl Default for Jitter {
    fn default() -> Self {
        Self::Equal
    }
}

/// Maps a failed attempt number to the delay to sleep before the next one.
///
/// The calculator is pure except for decorrelated jitter, whose
/// previous-delay state accumulates across attempts within a single retry
/// run; [`DelayCalculator::reset`] returns it to its initial state.
#[derive(Debug, Clone)]
pub struct DelayCalculator {
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Option<Duration>,
    multiplier: f64,
    jitter: Jitter,
    previous: Option<Duration>,
}

impl DelayCalculator {
    /// Create a new calculator.
    pub fn new(
        strategy: BackoffStrategy,
        base_delay: Duration,
        max_delay: Option<Duration>,
        multiplier: f64,
        jitter: Jitter,
    ) -> Self {
        Self { strategy, base_delay, max_delay, multiplier, jitter, previous: None }
    }

    /// Compute the pre-jitter delay after the given failed attempt
    /// (1-based), capped at the configured maximum.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt) * self.multiplier,
            BackoffStrategy::Exponential => {
                base_ms * self.multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };

        let capped_ms = match self.max_delay {
            Some(max) => raw_ms.min(max.as_millis() as f64),
            None => raw_ms,
        };

        Duration::from_millis(capped_ms as u64)
    }

    /// Compute the jittered delay after the given failed attempt (1-based),
    /// advancing the decorrelated-jitter state.
    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        let delay = self.apply_jitter(self.base_delay_for(attempt));
        self.previous = Some(delay);
        delay
    }

    /// Reset the decorrelated-jitter state to its initial value.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..=delay_ms))
            }
            Jitter::Equal => {
                let half = delay_ms / 2;
                let mut rng = rand::thread_rng();
                Duration::from_millis(half + rng.gen_range(0..=delay_ms - half))
            }
            Jitter::Decorrelated => {
                let lower = self.previous.unwrap_or(self.base_delay).as_millis() as u64;
                let upper = delay_ms.saturating_mul(3);
                if lower >= upper {
                    return Duration::from_millis(upper);
                }
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(lower..=upper))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator(
        strategy: BackoffStrategy,
        base_ms: u64,
        max_ms: Option<u64>,
        multiplier: f64,
        jitter: Jitter,
    ) -> DelayCalculator {
        DelayCalculator::new(
            strategy,
            Duration::from_millis(base_ms),
            max_ms.map(Duration::from_millis),
            multiplier,
            jitter,
        )
    }

    #[test]
    fn test_fixed_backoff() {
        let calc = calculator(BackoffStrategy::Fixed, 100, None, 2.0, Jitter::None);

        assert_eq!(calc.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(calc.base_delay_for(5), Duration::from_millis(100));
        assert_eq!(calc.base_delay_for(50), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let calc = calculator(BackoffStrategy::Linear, 100, None, 1.0, Jitter::None);

        assert_eq!(calc.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(calc.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(calc.base_delay_for(5), Duration::from_millis(500));
    }

    /// Exponential backoff with base 100ms and multiplier 2 yields 100, 200
    /// and 400ms for the delays preceding attempts 2, 3 and 4.
    #[test]
    fn test_exponential_backoff() {
        let calc = calculator(BackoffStrategy::Exponential, 100, None, 2.0, Jitter::None);

        assert_eq!(calc.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(calc.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(calc.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(calc.base_delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let calc = calculator(BackoffStrategy::Exponential, 100, Some(500), 2.0, Jitter::None);

        assert_eq!(calc.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(calc.base_delay_for(4), Duration::from_millis(500));
        assert_eq!(calc.base_delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_full_jitter_stays_within_delay() {
        let mut calc = calculator(BackoffStrategy::Fixed, 1000, None, 2.0, Jitter::Full);

        for attempt in 1..=20 {
            let delay = calc.delay_for(attempt);
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_equal_jitter_keeps_at_least_half() {
        let mut calc = calculator(BackoffStrategy::Fixed, 1000, None, 2.0, Jitter::Equal);

        for attempt in 1..=20 {
            let delay = calc.delay_for(attempt);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_decorrelated_jitter_bounded_by_triple_delay() {
        let mut calc = calculator(BackoffStrategy::Fixed, 100, None, 2.0, Jitter::Decorrelated);

        let first = calc.delay_for(1);
        assert!(first >= Duration::from_millis(100), "first draw starts at base delay");
        assert!(first <= Duration::from_millis(300));

        for attempt in 2..=10 {
            let delay = calc.delay_for(attempt);
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_decorrelated_reset_forgets_previous_delay() {
        let mut calc = calculator(BackoffStrategy::Fixed, 100, None, 2.0, Jitter::Decorrelated);

        let _ = calc.delay_for(1);
        let _ = calc.delay_for(2);
        calc.reset();

        let fresh = calc.delay_for(1);
        assert!(fresh >= Duration::from_millis(100));
        assert!(fresh <= Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_varies_delays() {
        let mut calc = calculator(BackoffStrategy::Fixed, 10_000, None, 2.0, Jitter::Full);

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(calc.delay_for(1));
        }
        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "full jitter should vary across draws");
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).expect("serialize");
        assert_eq!(json, "\"exponential\"");

        let jitter: Jitter = serde_json::from_str("\"decorrelated\"").expect("deserialize");
        assert_eq!(jitter, Jitter::Decorrelated);
    }
}
