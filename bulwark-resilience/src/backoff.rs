//! Exponential backoff with optional jitter

use rand::Rng;
use std::time::Duration;

/// Relative spread applied when jitter is enabled (±10%)
pub const JITTER_FACTOR: f64 = 0.1;

/// Backoff delay calculator
///
/// `delay(n) = min(max_delay, initial_delay * multiplier^n)`, optionally
/// perturbed by ±[`JITTER_FACTOR`].
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl BackoffCalculator {
    /// Create a new backoff calculator
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter,
        }
    }

    /// Calculate the delay after `retry_count` recorded failures
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let capped_delay = self.calculate_base_delay(retry_count);

        if self.jitter {
            self.add_jitter(capped_delay)
        } else {
            capped_delay
        }
    }

    fn calculate_base_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_factor = rng.gen_range((1.0 - JITTER_FACTOR)..=(1.0 + JITTER_FACTOR));
        Duration::try_from_secs_f64(delay.as_secs_f64() * jitter_factor).unwrap_or(delay)
    }
}
