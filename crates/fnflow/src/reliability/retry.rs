//! Exponential backoff for controller-driven task retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Retry policy for controller-driven task invocation.
///
/// Defaults (100 ms initial interval, 30 s cap, 5 attempts, 2x backoff
/// coefficient, 10% jitter) are the values this crate's controllers are
/// specified to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Fraction of the computed delay to randomize by, e.g. `0.1` for ±10%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// The delay to wait before the `attempt`-th retry (1-based: the delay
    /// before the first retry is `delay_for_attempt(1)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_millis = self.initial_interval.as_millis() as f64 * self.backoff_coefficient.powi(exponent);
        let capped_millis = base_millis.min(self.max_interval.as_millis() as f64);

        let jittered_millis = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped_millis * self.jitter;
            capped_millis + rng.gen_range(-jitter_range..=jitter_range)
        } else {
            capped_millis
        };

        Duration::from_millis(jittered_millis.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
