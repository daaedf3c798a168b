//! Retry backoff with optional jitter.
//!
//! The wait before retry `n` (1-based, counted from the failed attempt) is
//! `min(initial_wait · backoff_base^(n-1), max_wait)`. Jitter, when enabled,
//! spreads that wait to keep concurrent runs from retrying in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

/// Jitter strategy applied on top of the exponential wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed wait as is.
    #[default]
    None,
    /// Random from 0 to the computed wait.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Wait after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,
    /// Multiplier applied per further attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Upper bound on any single wait, in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_initial_wait_ms() -> u64 {
    100
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_max_wait_ms() -> u64 {
    10_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_wait_ms: default_initial_wait_ms(),
            backoff_base: default_backoff_base(),
            max_wait_ms: default_max_wait_ms(),
            jitter: JitterStrategy::None,
        }
    }
}

impl BackoffPolicy {
    /// Creates the default policy (100ms, x2.0, capped at 10s, no jitter).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never waits. Useful in tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_wait_ms: 0,
            backoff_base: 1.0,
            max_wait_ms: 0,
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the initial wait.
    #[must_use]
    pub fn with_initial_wait_ms(mut self, wait: u64) -> Self {
        self.initial_wait_ms = wait;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    /// Sets the cap.
    #[must_use]
    pub fn with_max_wait_ms(mut self, wait: u64) -> Self {
        self.max_wait_ms = wait;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.backoff_base must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.max_wait_ms < self.initial_wait_ms {
            return Err(ConfigError::Invalid(
                "backoff.max_wait_ms must not be less than backoff.initial_wait_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// The un-jittered wait after failed attempt `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_wait_ms as f64 * self.backoff_base.powi(exponent);
        let capped = raw.min(self.max_wait_ms as f64);
        let millis = if capped.is_finite() && capped > 0.0 {
            capped as u64
        } else if capped > 0.0 {
            self.max_wait_ms
        } else {
            0
        };
        Duration::from_millis(millis)
    }

    /// The wait after failed attempt `attempt`, with jitter applied.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt).as_millis() as u64;
        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(8), Duration::from_millis(10_000));
    }

    #[test]
    fn test_cap_holds_for_huge_attempts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(3), policy.base_delay(3));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let policy = BackoffPolicy::default().with_jitter(JitterStrategy::Full);
        for _ in 0..100 {
            assert!(policy.delay(3) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let policy = BackoffPolicy::default().with_jitter(JitterStrategy::Equal);
        for _ in 0..100 {
            let d = policy.delay(3);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_immediate_never_waits() {
        let policy = BackoffPolicy::immediate();
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(10), Duration::ZERO);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(BackoffPolicy::default().with_base(0.5).validate().is_err());
        assert!(BackoffPolicy::default()
            .with_initial_wait_ms(500)
            .with_max_wait_ms(100)
            .validate()
            .is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"jitter": "full"}"#).unwrap();
        assert_eq!(policy.initial_wait_ms, 100);
        assert_eq!(policy.jitter, JitterStrategy::Full);
    }
}
