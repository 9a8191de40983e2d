//! Escalation Port - Restart Action for Persistent Failure
//!
//! Invoked by the health tracker once consecutive cycle failures reach
//! the configured threshold. Implementations are expected to attempt an
//! external restart and then bring the process down.

use async_trait::async_trait;

/// Action fired when the failure threshold is crossed.
#[async_trait]
pub trait Escalation: Send + Sync + 'static {
  /// Called exactly once per threshold crossing.
  async fn on_threshold_exceeded(&self, consecutive_failures: u32);
}
