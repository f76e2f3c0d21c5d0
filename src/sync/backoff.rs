//! Exponential backoff shared by stream reconnects and snapshot retries.

use std::time::Duration;

use rand::Rng;

/// `initial * multiplier^(attempt-1)`, capped at `max`, with symmetric
/// proportional jitter. The jittered delay never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fraction of the base delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Same schedule without jitter.
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: 0.0,
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        let secs: Vec<u64> = (1..=7).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_attempt_zero_and_huge_attempts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band_and_under_cap() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = policy.delay_with(attempt, &mut rng).as_secs_f64();
                assert!(d >= base * 0.8 - 1e-9, "attempt {attempt}: {d} < {base}*0.8");
                assert!(d <= (base * 1.2).min(30.0) + 1e-9);
            }
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(3), Duration::from_secs(4));
    }
}
