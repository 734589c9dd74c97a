//! Restart backoff

use crate::compose::config::BackoffSpec;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_JITTER: f64 = 0.1;

/// Exponential backoff between restart attempts
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Attempts allowed under `on-failure`, counting the first
    pub max_attempts: u32,
    /// Up to this fraction of the delay is added at random
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Apply a project file override on top of the defaults
    pub fn from_spec(spec: Option<&BackoffSpec>) -> Self {
        let defaults = Self::default();
        let Some(spec) = spec else {
            return defaults;
        };

        Self {
            initial: spec.initial.unwrap_or(defaults.initial),
            max: spec.max.unwrap_or(defaults.max),
            max_attempts: spec.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            jitter: spec.jitter.unwrap_or(defaults.jitter).clamp(0.0, 1.0),
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.initial.saturating_mul(1u32 << exponent).min(self.max);

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
            let extra = Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(self.max);
            base.saturating_add(extra)
        } else {
            base
        };
        jittered.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_growth_until_cap() {
        let policy = fixed();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_keeps_delays_increasing_below_cap() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delays: Vec<Duration> = (1..=4).map(|n| policy.delay(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
            assert!(delays[0] >= Duration::from_secs(1));
            assert!(delays[0] <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_huge_delays_saturate() {
        let policy = BackoffPolicy {
            initial: Duration::MAX,
            max: Duration::MAX,
            jitter: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(5), Duration::MAX);
    }

    #[test]
    fn test_from_spec_overrides() {
        let spec = BackoffSpec {
            initial: Some(Duration::from_millis(200)),
            max: None,
            max_attempts: Some(5),
            jitter: Some(0.0),
        };
        let policy = BackoffPolicy::from_spec(Some(&spec));
        assert_eq!(policy.initial, Duration::from_millis(200));
        assert_eq!(policy.max, DEFAULT_MAX_DELAY);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }
}
