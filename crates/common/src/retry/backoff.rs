//! Exponential backoff with optional jitter
//!
//! Attempt `k` (1-based) waits `initial_delay * multiplier^(k-1)`, capped at
//! `max_delay`. With jitter enabled the capped value is scaled by a random
//! factor in `[0.5, 1.0]`, so a jittered delay never exceeds the unjittered
//! one.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};
use crate::utils::serde::duration_millis;

/// Largest exponent evaluated before the result is pinned to `max_delay`
const MAX_EXPONENT: u32 = 63;

/// Lower bound of the jitter factor
const JITTER_FLOOR: f64 = 0.5;

/// Backoff schedule for failed operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Growth factor applied per attempt (must be >= 1.0)
    pub multiplier: f64,
    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Scale each delay to 50-100% of its computed value
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Backoff without jitter, handy for deterministic schedules
    pub fn fixed(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self { initial_delay, multiplier, max_delay, jitter: false }
    }

    /// Check the schedule is monotonic and bounded
    pub fn validate(&self) -> CommonResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CommonError::config_field(
                "multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(CommonError::config_field(
                "initial_delay",
                format!(
                    "initial_delay ({:?}) cannot exceed max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            ));
        }
        Ok(())
    }

    /// Delay for `attempt` before jitter; attempt 0 is treated as 1
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let raw = initial_ms * self.multiplier.powi(exponent as i32);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };

        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay for `attempt`, jittered when enabled
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied RNG
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range(JITTER_FLOOR..=1.0);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn delays_grow_geometrically_until_capped() {
        let backoff =
            ExponentialBackoff::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(10));

        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(4));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(8));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(10));
        assert_eq!(backoff.base_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn base_delay_is_monotonic() {
        let backoff =
            ExponentialBackoff::fixed(Duration::from_millis(150), 1.7, Duration::from_secs(45));
        let delays: Vec<_> = (1..=80).map(|k| backoff.base_delay(k)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn attempt_zero_matches_first_attempt() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.base_delay(0), backoff.base_delay(1));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let backoff = ExponentialBackoff {
            initial_delay: Duration::from_millis(800),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        };
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..=6 {
            let base = backoff.base_delay(attempt);
            for _ in 0..50 {
                let jittered = backoff.delay_with(attempt, &mut rng);
                assert!(jittered >= base.mul_f64(0.5), "{jittered:?} below floor of {base:?}");
                assert!(jittered <= base, "{jittered:?} above {base:?}");
            }
        }
    }

    #[test]
    fn validate_rejects_shrinking_multiplier() {
        let backoff =
            ExponentialBackoff::fixed(Duration::from_secs(1), 0.5, Duration::from_secs(10));
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn validate_rejects_initial_above_max() {
        let backoff =
            ExponentialBackoff::fixed(Duration::from_secs(60), 2.0, Duration::from_secs(10));
        assert!(backoff.validate().is_err());
        assert!(ExponentialBackoff::default().validate().is_ok());
    }

    #[test]
    fn deserializes_partial_config() {
        let backoff: ExponentialBackoff =
            serde_json::from_str(r#"{"initial_delay":500,"jitter":false}"#).unwrap();
        assert_eq!(backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
        assert!(!backoff.jitter);
    }
}
