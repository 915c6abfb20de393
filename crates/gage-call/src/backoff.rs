//! Reconnect backoff policy.
//!
//! All of the reconnect arithmetic lives here so the signaling channel only
//! ever asks two questions: "may I try again?" and "how long do I wait?".

use crate::health::HealthMonitor;
use gage_common::config::SignalingConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff (factor 1.5) scaled by link health, plus jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    cap_ms: u64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            base_ms: config.reconnect_base_ms,
            max_ms: config.reconnect_max_ms,
            jitter_ms: config.jitter_ms,
            cap_ms: config.reconnect_cap_ms,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once `attempts` consecutive reconnects have been used up.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }

    /// `min(base * 1.5^(attempts-1), max)`, before health scaling.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let ms = (self.base_ms as f64 * 1.5f64.powi(exponent)).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Deterministic core of [`next_delay`](Self::next_delay).
    pub fn delay_with(
        &self,
        attempts: u32,
        multiplier: f64,
        cooldown: Duration,
        jitter: Duration,
    ) -> Duration {
        let scaled = self.base_delay(attempts).as_millis() as f64 * multiplier.max(1.0);
        let total = scaled + cooldown.as_millis() as f64 + jitter.as_millis() as f64;
        Duration::from_millis(total.clamp(0.0, self.cap_ms as f64) as u64)
    }

    /// Delay before reconnect number `attempts` (1-based).
    pub fn next_delay(&self, attempts: u32, health: &HealthMonitor) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.jitter_ms)
        };
        self.delay_with(
            attempts,
            health.backoff_multiplier(),
            health.cooldown(),
            Duration::from_millis(jitter),
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_by_half() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1_500));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2_250));
        assert_eq!(policy.base_delay(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_with(
            10,
            6.0,
            Duration::from_millis(30_000),
            Duration::from_millis(999),
        );
        assert_eq!(delay, Duration::from_millis(45_000));
    }

    #[test]
    fn test_next_delay_always_within_bounds() {
        let policy = BackoffPolicy::default();
        let mut health = HealthMonitor::default();
        for attempt in 1..=policy.max_attempts() {
            health.record_unclean_close();
            let delay = policy.next_delay(attempt, &health);
            assert!(delay <= Duration::from_millis(45_000), "attempt {attempt}: {delay:?}");
            assert!(delay >= policy.base_delay(attempt));
        }
    }

    #[test]
    fn test_jitter_stays_under_one_second() {
        let policy = BackoffPolicy::default();
        let health = HealthMonitor::default();
        for _ in 0..100 {
            let delay = policy.next_delay(1, &health);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay < Duration::from_millis(2_000));
        }
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(!policy.exhausted(10));
        assert!(policy.exhausted(11));
    }
}
