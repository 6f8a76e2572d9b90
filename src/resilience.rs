//! Retry and backoff policy shared by the publisher and consumer paths.
//!
//! The publisher gets a short bounded budget so a mutation is never held up
//! by an absent broker; the consumer retries forever.
//!
//! ```rust
//! use catalog_sync::resilience::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::fixed(Duration::from_secs(5));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
//! assert!(!policy.is_exhausted(1_000));
//! ```

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Multiplier per attempt; 1.0 gives a fixed delay.
    pub backoff_factor: f64,

    /// Fraction of the delay randomized away, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Retry forever with a constant delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Fail fast so tests stay quick.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// True once `attempts` failures have used up the budget.
    pub fn is_exhausted(&self, attempts: usize) -> bool {
        attempts >= self.max_attempts
    }

    /// Backoff before the next try, given the 1-indexed failed attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.apply_jitter(self.initial_delay.min(self.max_delay));
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.max(1.0).powi(exponent);
        let delay_secs = (self.initial_delay.as_secs_f64() * multiplier)
            .min(self.max_delay.as_secs_f64());

        self.apply_jitter(Duration::from_secs_f64(delay_secs))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(0.0..=spread);
        Duration::from_secs_f64(delay.as_secs_f64() - offset)
    }
}
