//! Connection health — how flaky has the signaling link been lately?
//!
//! Every unclean socket closure raises the instability count. Every full
//! stable period spent connected lowers it again, one step at a time, so a
//! link that has been bouncing needs a while of good behavior before the
//! reconnect delays shrink back to normal.

use chrono::{DateTime, Utc};
use gage_common::config::HealthConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Point-in-time view of the monitor, exposed to UI collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub instability_count: u32,
    pub last_stable_at: Option<DateTime<Utc>>,
    /// Exponentially smoothed length of recent connected periods.
    pub smoothed_uptime_ms: Option<u64>,
    /// Extra wait currently layered on top of the reconnect backoff.
    pub cooldown_ms: u64,
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    instability_count: u32,
    last_stable_at: Option<DateTime<Utc>>,
    smoothed_uptime_ms: Option<f64>,
    /// Start of the connected window that has not yet earned a credit.
    stable_since: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            instability_count: 0,
            last_stable_at: None,
            smoothed_uptime_ms: None,
            stable_since: None,
        }
    }

    pub fn instability_count(&self) -> u32 {
        self.instability_count
    }

    /// The socket closed without anyone asking it to.
    pub fn record_unclean_close(&mut self) {
        self.instability_count = self.instability_count.saturating_add(1);
        tracing::debug!(instability = self.instability_count, "Unclean signaling closure recorded");
    }

    pub fn connection_opened(&mut self, now: Instant) {
        self.stable_since = Some(now);
    }

    /// Called periodically while connected. Grants one credit per completed
    /// stable period.
    pub fn tick(&mut self, now: Instant) {
        let Some(since) = self.stable_since else { return };
        let period = Duration::from_millis(self.config.stable_period_ms);
        if now.saturating_duration_since(since) >= period {
            self.instability_count = self.instability_count.saturating_sub(1);
            self.last_stable_at = Some(Utc::now());
            self.stable_since = Some(now);
        }
    }

    /// The connection that opened at `opened_at` has ended.
    pub fn connection_closed(&mut self, opened_at: Instant, now: Instant) {
        self.tick(now);
        self.stable_since = None;

        let uptime = now.saturating_duration_since(opened_at).as_millis() as f64;
        let alpha = self.config.uptime_smoothing.clamp(0.0, 1.0);
        self.smoothed_uptime_ms = Some(match self.smoothed_uptime_ms {
            Some(prev) => alpha * uptime + (1.0 - alpha) * prev,
            None => uptime,
        });
    }

    /// Scale factor applied to the exponential backoff.
    pub fn backoff_multiplier(&self) -> f64 {
        (self.instability_count as f64 * 0.5).max(1.0)
    }

    /// Extra wait imposed once the link has proven unstable.
    pub fn cooldown(&self) -> Duration {
        if self.instability_count < self.config.instability_threshold {
            return Duration::ZERO;
        }
        let ms = (self.instability_count as u64)
            .saturating_mul(self.config.cooldown_step_ms)
            .min(self.config.cooldown_max_ms);
        Duration::from_millis(ms)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            instability_count: self.instability_count,
            last_stable_at: self.last_stable_at,
            smoothed_uptime_ms: self.smoothed_uptime_ms.map(|ms| ms.round() as u64),
            cooldown_ms: self.cooldown().as_millis() as u64,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cooldown_below_threshold() {
        let mut health = HealthMonitor::default();
        health.record_unclean_close();
        health.record_unclean_close();
        assert_eq!(health.cooldown(), Duration::ZERO);
        assert_eq!(health.backoff_multiplier(), 1.0);
    }

    #[test]
    fn test_cooldown_grows_and_caps() {
        let mut health = HealthMonitor::default();
        for _ in 0..3 {
            health.record_unclean_close();
        }
        assert_eq!(health.cooldown(), Duration::from_millis(15_000));
        assert_eq!(health.backoff_multiplier(), 1.5);

        for _ in 0..10 {
            health.record_unclean_close();
        }
        assert_eq!(health.cooldown(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_stable_period_earns_credit() {
        let mut health = HealthMonitor::default();
        health.record_unclean_close();
        health.record_unclean_close();

        let opened = Instant::now();
        health.connection_opened(opened);
        health.tick(opened + Duration::from_secs(30));
        assert_eq!(health.instability_count(), 2);

        health.tick(opened + Duration::from_secs(61));
        assert_eq!(health.instability_count(), 1);
        assert!(health.snapshot().last_stable_at.is_some());
    }

    #[test]
    fn test_credit_never_goes_below_zero() {
        let mut health = HealthMonitor::default();
        let opened = Instant::now();
        health.connection_opened(opened);
        health.connection_closed(opened, opened + Duration::from_secs(120));
        assert_eq!(health.instability_count(), 0);
    }

    #[test]
    fn test_uptime_is_smoothed() {
        let mut health = HealthMonitor::default();
        let t0 = Instant::now();
        health.connection_opened(t0);
        health.connection_closed(t0, t0 + Duration::from_millis(10_000));
        assert_eq!(health.snapshot().smoothed_uptime_ms, Some(10_000));

        let t1 = t0 + Duration::from_secs(20);
        health.connection_opened(t1);
        health.connection_closed(t1, t1 + Duration::from_millis(20_000));
        // 0.3 * 20000 + 0.7 * 10000
        assert_eq!(health.snapshot().smoothed_uptime_ms, Some(13_000));
    }
}
