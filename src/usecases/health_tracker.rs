//! Health Tracker - Consecutive Failure Counting and Escalation
//!
//! Counts consecutive failed cycles and publishes a `HealthReport`
//! after every outcome:
//! - Success resets the counter and re-arms escalation
//! - Each failure increments the counter
//! - Reaching the threshold fires the escalation port exactly once

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::outcome::{CycleOutcome, HealthReport, ServiceStatus};
use crate::ports::escalation::Escalation;

/// Tracks consecutive cycle failures.
pub struct HealthTracker {
  /// Failures since the last success.
  consecutive_failures: u32,
  /// Failures that trigger escalation.
  threshold: u32,
  /// Whether escalation already fired for the current failure run.
  escalated: bool,
  /// Restart action.
  escalation: Arc<dyn Escalation>,
  /// Published report.
  report_tx: watch::Sender<HealthReport>,
}

impl HealthTracker {
  /// Create a tracker. `threshold` must be at least 1.
  pub fn new(threshold: u32, escalation: Arc<dyn Escalation>) -> Self {
    let threshold = threshold.max(1);
    let (report_tx, _) = watch::channel(HealthReport::initial(threshold));
    Self {
      consecutive_failures: 0,
      threshold,
      escalated: false,
      escalation,
      report_tx,
    }
  }

  pub const fn consecutive_failures(&self) -> u32 {
    self.consecutive_failures
  }

  pub const fn threshold(&self) -> u32 {
    self.threshold
  }

  /// Receiver for the health server.
  pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
    self.report_tx.subscribe()
  }

  pub fn report(&self) -> HealthReport {
    self.report_tx.borrow().clone()
  }

  /// Dispatch on outcome.
  pub async fn record(&mut self, outcome: CycleOutcome, now: DateTime<Utc>) {
    if outcome.is_success() {
      self.record_success(now);
    } else {
      self.record_failure(outcome).await;
    }
  }

  pub fn record_success(&mut self, now: DateTime<Utc>) {
    if self.consecutive_failures > 0 {
      info!(
        previous_failures = self.consecutive_failures,
        "Cycle succeeded, failure counter reset"
      );
    }
    self.consecutive_failures = 0;
    self.escalated = false;

    self.report_tx.send_modify(|report| {
      report.status = ServiceStatus::Running;
      report.consecutive_failures = 0;
      report.last_outcome = Some(CycleOutcome::Success);
      report.last_success_at = Some(now);
    });
  }

  pub async fn record_failure(&mut self, outcome: CycleOutcome) {
    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    let failures = self.consecutive_failures;

    warn!(
      outcome = %outcome,
      failures,
      threshold = self.threshold,
      "Cycle failed"
    );

    self.report_tx.send_modify(|report| {
      report.status = ServiceStatus::Inactive;
      report.consecutive_failures = failures;
      report.last_outcome = Some(outcome);
    });

    if failures >= self.threshold && !self.escalated {
      self.escalated = true;
      error!(failures, "Failure threshold reached, escalating");
      self.escalation.on_threshold_exceeded(failures).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use async_trait::async_trait;
  use chrono::TimeZone;

  use super::*;

  #[derive(Default)]
  struct CountingEscalation {
    fired: AtomicU32,
  }

  #[async_trait]
  impl Escalation for CountingEscalation {
    async fn on_threshold_exceeded(&self, _consecutive_failures: u32) {
      self.fired.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
  }

  #[tokio::test]
  async fn test_escalates_once_at_threshold() {
    let escalation = Arc::new(CountingEscalation::default());
    let mut tracker = HealthTracker::new(3, escalation.clone());

    for _ in 0..2 {
      tracker.record_failure(CycleOutcome::NoPolledData).await;
    }
    assert_eq!(escalation.fired.load(Ordering::SeqCst), 0);

    tracker.record_failure(CycleOutcome::ConnectionLost).await;
    tracker.record_failure(CycleOutcome::ConnectionLost).await;
    assert_eq!(escalation.fired.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.consecutive_failures(), 4);
  }

  #[tokio::test]
  async fn test_success_resets_and_rearms() {
    let escalation = Arc::new(CountingEscalation::default());
    let mut tracker = HealthTracker::new(2, escalation.clone());

    tracker.record_failure(CycleOutcome::StreamingStale).await;
    tracker.record_failure(CycleOutcome::StreamingStale).await;
    tracker.record(CycleOutcome::Success, now()).await;
    assert_eq!(tracker.consecutive_failures(), 0);

    tracker.record_failure(CycleOutcome::PersistenceFailed).await;
    tracker.record_failure(CycleOutcome::PersistenceFailed).await;
    assert_eq!(escalation.fired.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_report_tracks_status() {
    let mut tracker = HealthTracker::new(10, Arc::new(CountingEscalation::default()));
    let rx = tracker.subscribe();

    tracker.record_failure(CycleOutcome::BelowThreshold).await;
    assert_eq!(rx.borrow().status, ServiceStatus::Inactive);
    assert_eq!(rx.borrow().consecutive_failures, 1);

    tracker.record_success(now());
    let report = rx.borrow().clone();
    assert_eq!(report.status, ServiceStatus::Running);
    assert_eq!(report.last_outcome, Some(CycleOutcome::Success));
    assert_eq!(report.last_success_at, Some(now()));
  }

  #[test]
  fn test_zero_threshold_clamped() {
    let tracker = HealthTracker::new(0, Arc::new(CountingEscalation::default()));
    assert_eq!(tracker.threshold(), 1);
  }
}
