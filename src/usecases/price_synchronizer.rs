//! Price Synchronizer - Periodic Two-Feed Join
//!
//! Runs the collection cycle until shutdown:
//! 1. Keep the streaming worker alive and the polled session connected
//! 2. Fetch one validated polled quote (bounded poll)
//! 3. Reject stale streaming state and force a streaming reset
//! 4. Join both quotes into one `PriceSnapshot` and persist it (time-bounded)
//! 5. Report the outcome to the health tracker and metrics
//!
//! A cycle never propagates a panic into the loop; it is converted to
//! `CycleOutcome::UnexpectedError`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument, warn};

use crate::domain::outcome::{CycleOutcome, HealthReport};
use crate::domain::quote::PriceSnapshot;
use crate::ports::clock::Clock;
use crate::ports::market_feed::StreamingFeed;
use crate::ports::metrics::CycleMetrics;
use crate::ports::quote_session::QuoteSession;
use crate::ports::repository::SnapshotStore;

use super::health_tracker::HealthTracker;
use super::polled_feed::PolledFeedClient;

/// Loop cadence and freshness parameters.
#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Sleep after a successful cycle.
  pub success_delay: Duration,
  /// Sleep after any failed cycle.
  pub failure_delay: Duration,
  /// Maximum age of the streaming quote.
  pub stale_window: chrono::Duration,
  /// Bound on a single persistence call.
  pub persist_timeout: Duration,
  /// Wait after (re)starting the streaming worker. Longer than the
  /// worker's first backoff delay, or the next read is always stale.
  pub streaming_warmup: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      success_delay: Duration::from_secs(15),
      failure_delay: Duration::from_secs(20),
      stale_window: chrono::Duration::seconds(30),
      persist_timeout: Duration::from_secs(10),
      streaming_warmup: Duration::from_secs(8),
    }
  }
}

/// Orchestrator joining the polled and streaming feeds.
///
/// The only writer of snapshots and the only caller of the store. Reads
/// the streaming `FeedState` but never writes it; a reset request is
/// the only influence it has on that feed.
pub struct PriceSynchronizer<S, F, P>
where
  S: QuoteSession,
  F: StreamingFeed,
  P: SnapshotStore,
{
  /// Polled quote source (owned, single-threaded).
  polled: PolledFeedClient<S>,
  /// Streaming quote source.
  streaming: Arc<F>,
  /// Snapshot persistence.
  store: Arc<P>,
  /// Consecutive failure tracking.
  health: HealthTracker,
  /// Time source.
  clock: Arc<dyn Clock>,
  /// Cadence and freshness.
  config: SyncConfig,
  /// Optional metrics sink.
  metrics: Option<Arc<dyn CycleMetrics>>,
}

impl<S, F, P> PriceSynchronizer<S, F, P>
where
  S: QuoteSession,
  F: StreamingFeed,
  P: SnapshotStore,
{
  pub fn new(
    polled: PolledFeedClient<S>,
    streaming: Arc<F>,
    store: Arc<P>,
    health: HealthTracker,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
  ) -> Self {
    Self {
      polled,
      streaming,
      store,
      health,
      clock,
      config,
      metrics: None,
    }
  }

  #[must_use]
  pub fn with_metrics(mut self, metrics: Arc<dyn CycleMetrics>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub const fn health(&self) -> &HealthTracker {
    &self.health
  }

  pub const fn polled(&self) -> &PolledFeedClient<S> {
    &self.polled
  }

  /// Receiver for the published health report.
  pub fn subscribe_health(&self) -> watch::Receiver<HealthReport> {
    self.health.subscribe()
  }

  /// Run cycles until `shutdown_rx` fires.
  #[instrument(skip_all)]
  pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
    info!(
      success_delay_secs = self.config.success_delay.as_secs(),
      failure_delay_secs = self.config.failure_delay.as_secs(),
      stale_window_secs = self.config.stale_window.num_seconds(),
      "Starting price synchronizer"
    );

    loop {
      let outcome = tokio::select! {
        biased;
        _ = shutdown_rx.recv() => break,
        outcome = self.step() => outcome,
      };

      let delay = if outcome.is_success() {
        self.config.success_delay
      } else {
        self.config.failure_delay
      };

      tokio::select! {
        biased;
        _ = shutdown_rx.recv() => break,
        () = self.clock.sleep(delay) => {}
      }
    }

    info!("Price synchronizer stopped");
  }

  /// One cycle plus health and metrics reporting.
  pub async fn step(&mut self) -> CycleOutcome {
    let outcome = self.run_cycle().await;
    self.health.record(outcome, self.clock.now()).await;
    if let Some(metrics) = &self.metrics {
      metrics.record_cycle(outcome, self.health.consecutive_failures());
    }
    outcome
  }

  /// Execute one cycle, converting a panic into an outcome.
  pub async fn run_cycle(&mut self) -> CycleOutcome {
    match AssertUnwindSafe(self.cycle()).catch_unwind().await {
      Ok(outcome) => outcome,
      Err(panic) => {
        error!(panic = %panic_message(panic.as_ref()), "Collection cycle panicked");
        CycleOutcome::UnexpectedError
      }
    }
  }

  /// Adapter failures arrive as typed `QuoteFailure`s or store
  /// results, so the only abnormal exit is a panic.
  async fn cycle(&mut self) -> CycleOutcome {
    // 1. Both feeds alive
    if self.streaming.ensure_running() {
      self.clock.sleep(self.config.streaming_warmup).await;
    }
    self.observe_streaming();
    if let Err(failure) = self.polled.ensure_connected().await {
      self.observe_polled();
      return failure.into();
    }

    // 2. Polled quote
    let polled = self.polled.fetch_quote().await;
    self.observe_polled();
    let polled = match polled {
      Ok(quote) => quote,
      Err(failure) => return failure.into(),
    };

    // 3. Streaming freshness
    let now = self.clock.now();
    let streaming = self.streaming.state();

    let streamed = match streaming.quote {
      Some(quote) if !streaming.is_stale(now, self.config.stale_window) => quote,
      _ => {
        warn!(
          age_secs = streaming.age(now).map(|a| a.num_seconds()),
          window_secs = self.config.stale_window.num_seconds(),
          connection = %streaming.connection_state,
          "Streaming prices missing or stale, resetting subscription"
        );
        self.streaming.reset().await;
        return CycleOutcome::StreamingStale;
      }
    };

    // 4. Join and persist
    let snapshot = PriceSnapshot::new(now, polled, streamed);
    match tokio::time::timeout(self.config.persist_timeout, self.store.insert(&snapshot)).await {
      Ok(true) => {
        info!(
          captured_at = %snapshot.captured_at,
          polled = %snapshot.polled(),
          streamed = %snapshot.streamed(),
          "Snapshot stored"
        );
        CycleOutcome::Success
      }
      Ok(false) => {
        warn!("Snapshot not confirmed by store");
        CycleOutcome::PersistenceFailed
      }
      Err(_) => {
        warn!(
          timeout_secs = self.config.persist_timeout.as_secs(),
          "Snapshot store timed out"
        );
        CycleOutcome::PersistenceFailed
      }
    }
  }

  /// Report streaming connection and quote age whatever the polled side does.
  fn observe_streaming(&self) {
    if let Some(metrics) = &self.metrics {
      let state = self.streaming.state();
      metrics.observe_feed(self.streaming.source(), &state);
      metrics.observe_streaming_age(state.age(self.clock.now()));
    }
  }

  fn observe_polled(&self) {
    if let Some(metrics) = &self.metrics {
      metrics.observe_feed(self.polled.source(), &self.polled.state());
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  panic
    .downcast_ref::<&str>()
    .map(|s| (*s).to_string())
    .or_else(|| panic.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string())
}
