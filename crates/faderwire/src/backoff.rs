//! Reconnect backoff.
//!
//! Exponential, capped, with optional jitter:
//! attempt 1: base
//! attempt 2: base * 2
//! attempt n: min(base * 2^(n-1), max)
//!
//! With jitter the actual delay is drawn uniformly from [delay/2, delay], so
//! a fleet of clients doesn't reconnect in lockstep after a console reboot.

use std::time::Duration;

use faderconf::ReconnectConfig;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Ceiling for exponential growth
    pub max: Duration,
    pub jitter: bool,
    /// Consecutive failures allowed before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: true,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the delay before `attempt`, before jitter.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(multiplier);
        std::cmp::min(delay, self.max)
    }

    /// Delay to sleep before `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(ceiling_ms / 2..=ceiling_ms))
    }

    /// Whether `failures` consecutive failures use up the retry budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}
