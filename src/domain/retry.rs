//! Exponential backoff policy.
//!
//! Pure state machine with no clock access. The supervisor in
//! `usecases::retry_supervisor` drives it and does the sleeping.

use std::time::Duration;

/// Backoff parameters shared by both feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first attempt of a round.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts per round before the cooldown.
    pub max_attempts_per_round: u32,
    /// Sleep between rounds.
    pub cooldown: Duration,
    /// Give up after this many failed rounds. `None` retries forever.
    pub max_rounds: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts_per_round: 5,
            cooldown: Duration::from_secs(60),
            max_rounds: None,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn with_max_rounds(mut self, max_rounds: Option<u32>) -> Self {
        self.max_rounds = max_rounds;
        self
    }
}

/// Delay state for one connection.
///
/// Invariant: `current_delay == min(base_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            base_delay,
            max_delay,
            current_delay: base_delay.min(max_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Delay after `attempt` consecutive failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Register one failed attempt and double the delay.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = self.delay_for(self.attempt);
    }

    /// Back to `base_delay` with `attempt = 0`.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.delay_for(0);
    }
}
