//! Retry Supervisor - Backoff Rounds for Feed (Re)connection
//!
//! Runs bounded bursts of connection attempts with exponential delay,
//! separated by a long cooldown:
//! - Each attempt is preceded by a sleep of the current delay
//! - A failure doubles the delay, capped at `max_delay`
//! - A fully failed round sleeps `cooldown` and starts over at `base_delay`
//! - Success resets the policy and marks the feed `Connected`

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::outcome::PermanentFailure;
use crate::domain::quote::{ConnectionState, FeedStateCell};
use crate::domain::retry::{RetryConfig, RetryPolicy};
use crate::ports::clock::Clock;

/// Drives connection attempts for one feed.
pub struct RetrySupervisor {
  /// Feed name for logging.
  name: &'static str,
  /// Round/cooldown parameters.
  config: RetryConfig,
  /// Delay state carried across calls.
  policy: RetryPolicy,
  /// Time source.
  clock: Arc<dyn Clock>,
}

impl RetrySupervisor {
  pub fn new(name: &'static str, config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      name,
      policy: RetryPolicy::from_config(&config),
      config,
      clock,
    }
  }

  pub const fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Keep calling `connect` until it succeeds or the round budget runs out.
  ///
  /// `state` is moved through `Connecting`, then `Connected` or `Backoff`.
  /// With `max_rounds = None` this only returns on success.
  pub async fn attempt_connect<T, F, Fut>(
    &mut self,
    state: &FeedStateCell,
    mut connect: F,
  ) -> Result<T, PermanentFailure>
  where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<T>> + Send,
  {
    let attempts = self.config.max_attempts_per_round.max(1);
    let mut rounds = 0u32;

    loop {
      for attempt in 1..=attempts {
        self.clock.sleep(self.policy.current_delay()).await;
        state.set_connection(ConnectionState::Connecting);

        info!(
          feed = self.name,
          attempt,
          max_attempts = attempts,
          "Connecting"
        );

        match connect().await {
          Ok(connected) => {
            self.policy.reset();
            state.set_connection(ConnectionState::Connected);
            info!(feed = self.name, attempt, "Connected");
            return Ok(connected);
          }
          Err(e) => {
            self.policy.record_failure();
            state.set_connection(ConnectionState::Backoff);
            warn!(
              feed = self.name,
              attempt,
              error = %e,
              next_delay_secs = self.policy.current_delay().as_secs_f64(),
              "Connection attempt failed"
            );
          }
        }
      }

      rounds += 1;
      if self.config.max_rounds.is_some_and(|max| rounds >= max) {
        self.policy.reset();
        return Err(PermanentFailure { rounds, attempts });
      }

      warn!(
        feed = self.name,
        rounds,
        cooldown_secs = self.config.cooldown.as_secs(),
        "All attempts in round failed, cooling down"
      );
      self.clock.sleep(self.config.cooldown).await;
      self.policy.reset();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::ports::clock::ManualClock;

  fn clock() -> ManualClock {
    ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
  }

  fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
  }

  #[tokio::test]
  async fn test_first_attempt_success() {
    let clock = clock();
    let mut sup = RetrySupervisor::new("test", RetryConfig::default(), Arc::new(clock.clone()));
    let state = FeedStateCell::new();

    let result = sup.attempt_connect(&state, || async { Ok::<_, anyhow::Error>(42) }).await;

    assert_eq!(result, Ok(42));
    assert_eq!(clock.sleeps(), secs(&[5]));
    assert_eq!(state.snapshot().connection_state, ConnectionState::Connected);
  }

  #[tokio::test]
  async fn test_delays_double_between_failures() {
    let clock = clock();
    let mut sup = RetrySupervisor::new("test", RetryConfig::default(), Arc::new(clock.clone()));
    let state = FeedStateCell::new();
    let mut calls = 0;

    let result = sup
      .attempt_connect(&state, || {
        calls += 1;
        let ok = calls == 4;
        async move {
          if ok {
            Ok(())
          } else {
            Err(anyhow::anyhow!("refused"))
          }
        }
      })
      .await;

    assert!(result.is_ok());
    assert_eq!(clock.sleeps(), secs(&[5, 10, 20, 40]));
    assert_eq!(sup.policy().attempt(), 0);
    assert_eq!(sup.policy().current_delay(), Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_failed_round_cools_down_and_restarts_at_base() {
    let clock = clock();
    let mut sup = RetrySupervisor::new("test", RetryConfig::default(), Arc::new(clock.clone()));
    let state = FeedStateCell::new();
    let mut calls = 0;

    let result = sup
      .attempt_connect(&state, || {
        calls += 1;
        let ok = calls == 7;
        async move {
          if ok {
            Ok(())
          } else {
            Err(anyhow::anyhow!("refused"))
          }
        }
      })
      .await;

    assert!(result.is_ok());
    // Round one: 5 attempts, then cooldown; round two restarts at 5s.
    assert_eq!(clock.sleeps(), secs(&[5, 10, 20, 40, 60, 60, 5, 10]));
  }

  #[tokio::test]
  async fn test_bounded_rounds_give_up_without_cooldown() {
    let clock = clock();
    let config = RetryConfig::default().with_max_rounds(Some(1));
    let mut sup = RetrySupervisor::new("test", config, Arc::new(clock.clone()));
    let state = FeedStateCell::new();

    let result: Result<(), _> = sup
      .attempt_connect(&state, || async { Err::<(), _>(anyhow::anyhow!("down")) })
      .await;

    assert_eq!(
      result,
      Err(PermanentFailure {
        rounds: 1,
        attempts: 5
      })
    );
    assert_eq!(clock.sleeps(), secs(&[5, 10, 20, 40, 60]));
    assert_eq!(state.snapshot().connection_state, ConnectionState::Backoff);
    assert_eq!(sup.policy().current_delay(), Duration::from_secs(5));
  }
}
