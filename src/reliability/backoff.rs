/// Exponential backoff with jitter for retried calls.
use rand::Rng;
use std::time::Duration;

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter, e.g. 0.25 for ±25%
    pub jitter: f64,
}

impl RetryPolicy {
    /// Un-jittered delay before retry `attempt` (0-based).
    pub fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.min(32));
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Jittered delay before retry `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(apply_jitter(
            self.nominal_delay_ms(attempt),
            self.jitter,
            &mut rand::thread_rng(),
        ))
    }
}

/// Spread `base_ms` uniformly over `±jitter × base_ms`.
pub fn apply_jitter(base_ms: u64, jitter: f64, rng: &mut impl Rng) -> u64 {
    let range = (base_ms as f64 * jitter.clamp(0.0, 1.0)) as i64;
    if range == 0 {
        return base_ms;
    }
    let offset = rng.gen_range(-range..=range);
    (base_ms as i64 + offset).max(0) as u64
}
