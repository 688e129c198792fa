use rand::Rng;
use std::time::Duration;

/// Retry delay policy: attempt `k` waits `min(cap, base * 2^k)` plus a
/// uniformly random jitter in `[0, jitter)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(self.cap);
        if self.jitter.is_zero() {
            return exp;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..self.jitter.as_millis().max(1) as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}
