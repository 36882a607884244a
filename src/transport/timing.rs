//! Reconnect timing.

use std::time::Duration;

use serde::Deserialize;

use crate::core::{BACKOFF_BASE, BACKOFF_CAP};

/// Exponential reconnect backoff: `min(base * 2^attempts, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(with = "crate::core::duration_ms")]
    pub base: Duration,
    /// Upper bound on any delay.
    #[serde(with = "crate::core::duration_ms")]
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
        }
    }
}

impl Backoff {
    /// Create a backoff with the given base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next connection attempt after `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_defaults() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for attempts in 0..64 {
            let delay = backoff.delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= backoff.cap);
            previous = delay;
        }
        assert_eq!(backoff.delay(u32::MAX), backoff.cap);
    }

    #[test]
    fn test_backoff_cap_below_base() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
    }
}
