//! Metrics Port - Cycle Observability Sink
//!
//! The synchronizer reports every cycle through this trait. The
//! Prometheus adapter implements it; tests and metric-less runs pass
//! nothing.

use chrono::Duration;

use crate::domain::outcome::CycleOutcome;
use crate::domain::quote::FeedState;

/// Sink for per-cycle measurements.
pub trait CycleMetrics: Send + Sync + 'static {
  /// Count one finished cycle and the resulting failure streak.
  fn record_cycle(&self, outcome: CycleOutcome, consecutive_failures: u32);

  /// Connection state of one feed, by source name.
  fn observe_feed(&self, source: &str, state: &FeedState);

  /// Age of the streaming quote when read, `None` if absent.
  fn observe_streaming_age(&self, age: Option<Duration>);
}
