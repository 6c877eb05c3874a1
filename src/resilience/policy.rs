//! Retry policy: attempt budget and exponential backoff schedule.

use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY_MS: u64 = 2_000;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("max_attempts must be greater than zero")]
    ZeroAttempts,
    #[error("backoff_multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
}

/// Immutable retry configuration, built once at startup.
///
/// `max_attempts` counts every execution, including the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
    base_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay_ms: u64,
        backoff_multiplier: f64,
        max_delay_ms: u64,
    ) -> Result<Self, PolicyError> {
        let max_attempts = NonZeroU32::new(max_attempts).ok_or(PolicyError::ZeroAttempts)?;
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(backoff_multiplier));
        }

        Ok(Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            backoff_multiplier,
            max_delay: Duration::from_millis(max_delay_ms),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.get()
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait after the given (1-based) attempt failed:
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap_ms = self.max_delay.as_millis() as f64;
        if !scaled_ms.is_finite() || scaled_ms >= cap_ms {
            return self.max_delay;
        }
        Duration::from_millis(scaled_ms.round() as u64)
    }

    /// Sum of every backoff delay a permanently failing operation waits through.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts()).map(|attempt| self.delay_for(attempt)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_attempts_is_rejected() {
        assert_eq!(RetryPolicy::new(0, 100, 2.0, 1_000), Err(PolicyError::ZeroAttempts));
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        assert!(matches!(
            RetryPolicy::new(3, 100, 0.5, 1_000),
            Err(PolicyError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::new(3, 100, f64::NAN, 1_000),
            Err(PolicyError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn delays_grow_exponentially_until_capped() {
        let policy = RetryPolicy::new(6, 100, 2.0, 500).expect("valid policy");
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn total_backoff_covers_gaps_between_attempts_only() {
        let policy = RetryPolicy::new(3, 100, 2.0, 10_000).expect("valid policy");
        assert_eq!(policy.total_backoff(), Duration::from_millis(300));

        let single = RetryPolicy::new(1, 100, 2.0, 10_000).expect("valid policy");
        assert_eq!(single.total_backoff(), Duration::ZERO);
    }

    #[test]
    fn default_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(100));
        assert_eq!(policy.max_delay(), Duration::from_millis(2_000));
    }
}
