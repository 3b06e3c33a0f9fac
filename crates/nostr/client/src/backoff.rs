//! Exponential reconnect backoff with proportional jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Fraction of each delay randomized in either direction
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Randomize each delay by up to `fraction` of itself (clamped to 0..=1).
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt. Never exceeds the maximum delay.
    pub fn next_delay(&mut self) -> Duration {
        // capped_ms = min(base * 2^attempt, max)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let delay_ms = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            let jittered = capped_ms as f64 * (1.0 + spread);
            (jittered.max(0.0) as u128).min(max_ms)
        } else {
            capped_ms
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms.min(u64::MAX as u128) as u64)
    }

    /// Reset the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_is_deterministic_and_capped() {
        let mut backoff = ExponentialBackoff::default();

        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempt(), 7);
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(30_000))
                .with_jitter(0.2);

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(799));
        assert!(first <= Duration::from_millis(1200));

        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn reset_clears_attempts() {
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::default();
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
