//! Reconnect schedule for the agent client
//!
//! The agent keeps dialing the server until it comes up. Attempt `n` waits
//! `initial * multiplier^(n-1)`, capped at `max`, plus up to `jitter` of that
//! delay at random so several agents restarting together spread out.

use std::time::Duration;

use tr_core::config::BackoffConfig;

/// Delays between connection attempts, with an optional attempt budget
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    config: BackoffConfig,
    max_attempts: Option<u32>,
    /// Attempts already made
    attempts: u32,
}

impl ReconnectSchedule {
    /// `max_attempts` of `None` never gives up
    pub fn new(config: &BackoffConfig, max_attempts: Option<u32>) -> Self {
        let mut config = config.clone();
        config.jitter = config.jitter.clamp(0.0, 1.0);
        config.multiplier = config.multiplier.max(1.0);
        Self {
            config,
            max_attempts,
            attempts: 0,
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt.
    ///
    /// Returns the wait before the next one, or `None` once the budget is
    /// spent.
    pub fn failed(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }

        let base = self.base_delay(self.attempts);
        let spread = base.as_secs_f64() * self.config.jitter * rand::random::<f64>();
        Some(base + Duration::from_secs_f64(spread))
    }

    /// Un-jittered delay after `attempt` failures
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent);
        let max = self.config.max.as_secs_f64();
        if scaled.is_finite() && scaled < max {
            Duration::from_secs_f64(scaled)
        } else {
            self.config.max
        }
    }

    /// Forget past failures after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delays_double_up_to_max() {
        let mut schedule = ReconnectSchedule::new(&steady(250, 1_500), None);

        let delays: Vec<_> = (0..5).map(|_| schedule.failed().unwrap()).collect();
        assert_eq!(
            delays,
            [250, 500, 1_000, 1_500, 1_500].map(Duration::from_millis)
        );
        assert_eq!(schedule.attempts(), 5);
    }

    #[test]
    fn test_budget_is_spent() {
        let mut schedule = ReconnectSchedule::new(&steady(10, 100), Some(3));

        assert!(schedule.failed().is_some());
        assert!(schedule.failed().is_some());
        assert_eq!(schedule.failed(), None);
        assert_eq!(schedule.attempts(), 3);
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let mut schedule = ReconnectSchedule::new(&BackoffConfig::default(), Some(1));
        assert_eq!(schedule.failed(), None);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = BackoffConfig {
            jitter: 0.25,
            ..steady(1_000, 1_000)
        };
        let mut schedule = ReconnectSchedule::new(&config, None);

        for _ in 0..20 {
            let delay = schedule.failed().unwrap();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[test]
    fn test_long_outage_saturates_at_max() {
        let mut schedule = ReconnectSchedule::new(&steady(250, 10_000), None);
        for _ in 0..2_000 {
            schedule.failed();
        }
        assert_eq!(schedule.failed(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_reset() {
        let mut schedule = ReconnectSchedule::new(&steady(250, 10_000), None);
        schedule.failed();
        schedule.failed();
        schedule.reset();

        assert_eq!(schedule.attempts(), 0);
        assert_eq!(schedule.failed(), Some(Duration::from_millis(250)));
    }
}
