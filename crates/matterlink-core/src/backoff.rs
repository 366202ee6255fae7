// ── Exponential backoff with jitter ──
//
// base(n)  = min(min * 2^n, max)
// delay(n) = uniform in [base(n), min(2 * base(n), max)]
//
// The upper end of delay(n) never exceeds base(n + 1), so consecutive
// delays are non-decreasing and always bounded by `max`.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Stateful backoff counter. Call [`reset`](Self::reset) after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            min: config.min,
            max: config.max.max(config.min),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The un-jittered delay for attempt `n`.
    pub fn base(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.min.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let low = self.base(self.attempt);
        let high = low.saturating_mul(2).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if high <= low {
            return low;
        }
        let low_ns = u64::try_from(low.as_nanos()).unwrap_or(u64::MAX);
        let high_ns = u64::try_from(high.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(low_ns..=high_ns))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(min_ms: u64, max_ms: u64) -> Backoff {
        Backoff::new(BackoffConfig {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        for _ in 0..50 {
            let mut b = backoff(100, 10_000);
            let mut previous = Duration::ZERO;
            for _ in 0..40 {
                let d = b.next_delay();
                assert!(d >= previous, "{d:?} < {previous:?}");
                assert!(d <= Duration::from_millis(10_000));
                assert!(d >= Duration::from_millis(100));
                previous = d;
            }
        }
    }

    #[test]
    fn first_delay_is_between_min_and_twice_min() {
        let mut b = backoff(1_000, 300_000);
        let d = b.next_delay();
        assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        assert_eq!(b.attempt(), 1);
    }

    #[test]
    fn reset_returns_to_min() {
        let mut b = backoff(100, 10_000);
        for _ in 0..10 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay() <= Duration::from_millis(200));
    }

    #[test]
    fn base_saturates_at_max_for_huge_attempts() {
        let b = backoff(1_000, 300_000);
        assert_eq!(b.base(0), Duration::from_secs(1));
        assert_eq!(b.base(3), Duration::from_secs(8));
        assert_eq!(b.base(64), Duration::from_secs(300));
        assert_eq!(b.base(u32::MAX), Duration::from_secs(300));
    }
}
