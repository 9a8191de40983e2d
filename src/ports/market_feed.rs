//! Market Feed Port - Streaming Quote Source Interface
//!
//! Defines the trait the synchronizer uses to supervise and read a
//! long-lived streaming feed. The feed owns its `FeedState`; callers
//! only read it and may ask for a reset.

use async_trait::async_trait;

use crate::domain::quote::FeedState;

/// Trait for streaming feed providers.
///
/// Implementors run their own receive loop in a background task and
/// keep `FeedState` current. Transport and parse errors stay inside the
/// implementation and only show up as an absent or stale state.
#[async_trait]
pub trait StreamingFeed: Send + Sync + 'static {
  /// Short source name for logs and metrics.
  fn source(&self) -> &'static str;

  /// Start the worker if it is not running.
  ///
  /// Returns `true` when a new worker was spawned.
  fn ensure_running(&self) -> bool;

  /// Current state, copied out atomically.
  fn state(&self) -> FeedState;

  /// Unsubscribe, drop the connection, and clear the state so the
  /// worker re-establishes a fresh subscription.
  async fn reset(&self);

  /// Close the transport and wait for the worker to exit.
  async fn shutdown(&self);
}
