//! Clock Port - Time Source for Backoff and Staleness
//!
//! Every sleep and every "now" in the core goes through this trait so
//! retry rounds, poll windows, and staleness checks can run against
//! virtual time in tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of wall-clock time and delays.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
  /// Current wall-clock time.
  fn now(&self) -> DateTime<Utc>;

  /// Suspend the caller for `duration`.
  async fn sleep(&self, duration: Duration);
}

/// Production clock backed by `chrono::Utc` and `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  async fn sleep(&self, duration: Duration) {
    tokio::time::sleep(duration).await;
  }
}

#[derive(Debug)]
struct VirtualTime {
  now: DateTime<Utc>,
  sleeps: Vec<Duration>,
}

impl VirtualTime {
  fn advance(&mut self, duration: Duration) {
    if let Ok(delta) = chrono::Duration::from_std(duration) {
      self.now = self.now.checked_add_signed(delta).unwrap_or(self.now);
    }
  }
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
///
/// Lets tests drive whole retry rounds and poll windows without
/// waiting in real time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  inner: Arc<Mutex<VirtualTime>>,
}

impl ManualClock {
  /// Start the clock at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      inner: Arc::new(Mutex::new(VirtualTime {
        now: start,
        sleeps: Vec::new(),
      })),
    }
  }

  /// Move time forward without recording a sleep.
  pub fn advance(&self, duration: Duration) {
    self.lock().advance(duration);
  }

  /// Every duration passed to `sleep`, in call order.
  pub fn sleeps(&self) -> Vec<Duration> {
    self.lock().sleeps.clone()
  }

  /// Sum of all recorded sleeps.
  pub fn total_slept(&self) -> Duration {
    self.lock().sleeps.iter().sum()
  }

  fn lock(&self) -> MutexGuard<'_, VirtualTime> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.lock().now
  }

  async fn sleep(&self, duration: Duration) {
    {
      let mut inner = self.lock();
      inner.sleeps.push(duration);
      inner.advance(duration);
    }
    tokio::task::yield_now().await;
  }
}
