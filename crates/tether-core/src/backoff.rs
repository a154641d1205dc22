//! Exponential backoff with jitter
//!
//! Shared by the transport session (reconnect scheduling) and the offline
//! queue (per-operation retry delays). Delay for attempt `n` (0-based) is
//! `min(max, base * 2^n)` with up to 10% random jitter in either direction.

use std::time::Duration;

use rand::Rng;

/// Maximum jitter applied to a computed delay, as a fraction
const JITTER_FRACTION: f64 = 0.10;

/// Backoff policy parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Compute the jittered delay for the given 0-based attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.raw_delay(attempt).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64(exp * (1.0 + jitter))
    }

    /// The un-jittered delay for the given attempt
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        // Saturate the shift; 2^64 seconds is far past `max` anyway.
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base.saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX));
        delay.min(self.max)
    }

    /// Whether the given 0-based attempt number is past the cap
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }

    #[test]
    fn test_raw_delay_doubles() {
        let p = policy();
        assert_eq!(p.raw_delay(0), Duration::from_secs(1));
        assert_eq!(p.raw_delay(1), Duration::from_secs(2));
        assert_eq!(p.raw_delay(2), Duration::from_secs(4));
        assert_eq!(p.raw_delay(4), Duration::from_secs(16));
    }

    #[test]
    fn test_raw_delay_caps_at_max() {
        let p = policy();
        assert_eq!(p.raw_delay(5), Duration::from_secs(30));
        assert_eq!(p.raw_delay(20), Duration::from_secs(30));
        assert_eq!(p.raw_delay(63), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let p = policy();
        // Five consecutive attempts: each delay must be no sooner than
        // base * 2^(n-1) minus jitter and no later than max plus jitter.
        for attempt in 0..5u32 {
            let raw = p.raw_delay(attempt).as_secs_f64();
            let lo = raw * (1.0 - JITTER_FRACTION);
            let hi = (p.max.as_secs_f64()).min(raw) * (1.0 + JITTER_FRACTION);
            for _ in 0..50 {
                let d = p.delay(attempt).as_secs_f64();
                assert!(d >= lo - f64::EPSILON, "attempt {attempt}: {d} < {lo}");
                assert!(d <= hi + f64::EPSILON, "attempt {attempt}: {d} > {hi}");
            }
        }
    }

    #[test]
    fn test_exhausted() {
        let p = policy();
        assert!(!p.exhausted(0));
        assert!(!p.exhausted(9));
        assert!(p.exhausted(10));
        assert!(p.exhausted(11));
    }
}
