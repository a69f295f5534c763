//! Exponential backoff with jitter for transient task failures.

use rand::{thread_rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Backoff { base: Duration::from_millis(base_ms), max: Duration::from_millis(max_ms.max(base_ms)) }
    }

    /// Delay before retry number `attempt` (1-based): `base × 2^(attempt-1)`
    /// capped at `max`, plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.max.as_millis() as u64);
        let jitter = thread_rng().gen_range(0..(capped / 4 + 1));
        Duration::from_millis(capped + jitter)
    }
}

/// Whether a task that has run `attempts` times may run again.
pub fn may_retry(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let b = Backoff::new(100, 1_000);
        let d1 = b.delay(1).as_millis();
        let d3 = b.delay(3).as_millis();
        let d10 = b.delay(10).as_millis();
        assert!((100..=125).contains(&d1));
        assert!((400..=500).contains(&d3));
        assert!((1_000..=1_250).contains(&d10));
        assert_eq!(b.delay(0), Duration::ZERO);
    }

    #[test]
    fn retry_budget() {
        assert!(may_retry(1, 3));
        assert!(may_retry(2, 3));
        assert!(!may_retry(3, 3));
        assert!(!may_retry(1, 0));
    }
}
