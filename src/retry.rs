//! Reconnect backoff
//!
//! Exponential backoff with a cap and ±30% random jitter. Each supervisor owns
//! its own [`ExponentialBackoff`]; nothing here is global.

use rand::Rng;
use std::time::Duration;

/// Configuration for reconnect backoff
///
/// # Example
///
/// ```
/// use pg_walrelay::{BackoffConfig, ExponentialBackoff};
/// use std::time::Duration;
///
/// let config = BackoffConfig {
///     min_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
///     multiplier: 2.0,
///     jitter: false,
/// };
/// let mut backoff = ExponentialBackoff::new(&config);
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// ```
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect
    pub min_delay: Duration,
    /// Upper bound for any delay, jitter included
    pub max_delay: Duration,
    /// Growth factor applied after each attempt
    pub multiplier: f64,
    /// Whether to add ±30% random jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

const JITTER_FACTOR: f64 = 0.3;

/// Exponential backoff state
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let max_delay = config.max_delay.max(config.min_delay);
        Self {
            min_delay: config.min_delay,
            max_delay,
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter,
            current_delay: config.min_delay,
            attempt: 0,
        }
    }

    /// Get the next delay and advance the state
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;

        let next_nanos = (self.current_delay.as_nanos() as f64 * self.multiplier) as u64;
        self.current_delay = Duration::from_nanos(next_nanos).min(self.max_delay);
        self.attempt += 1;

        if self.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    /// Add jitter to the delay (±30% randomization), capped at the maximum
    fn add_jitter(&self, delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        let jittered = delay.as_secs_f64() * (1.0 + factor);
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_delay = self.min_delay;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self)
    }
}
