use std::time::Duration;
use uuid::Uuid;

/// Retry policy for transient upload failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed before a task becomes Failed-Permanent
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay
    pub max_delay: Duration,
    /// Extra random delay, as a fraction of the exponential delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failed attempts so far
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0) * random_unit();
        delay + delay.mul_f64(jitter)
    }

    /// Whether `attempts` used up the budget
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}

/// Uniform value in [0, 1)
fn random_unit() -> f64 {
    let bits = (Uuid::new_v4().as_u128() >> 64) as u64;
    (bits >> 11) as f64 / (1u64 << 53) as f64
}
