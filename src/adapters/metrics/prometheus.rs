//! Prometheus Metrics Registry - Collector Observability
//!
//! Registers and exposes Prometheus metrics on :9090. Covers cycle
//! outcomes, stored snapshots, failure streaks, feed connectivity, and
//! streaming quote freshness.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::domain::outcome::CycleOutcome;
use crate::domain::quote::{ConnectionState, FeedState};
use crate::ports::metrics::CycleMetrics;

/// Centralized Prometheus metrics for the price collector.
///
/// All metrics follow the naming convention `price_collector_*`.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Cycles by outcome label.
    pub cycles: IntCounterVec,
    /// Snapshots confirmed by the store.
    pub snapshots_stored: IntCounter,
    /// Current failure streak.
    pub consecutive_failures: IntGauge,
    /// Feed connection status (1 = connected, 0 = otherwise).
    pub feed_connected: GaugeVec,
    /// Age of the streaming quote at the last cycle (-1 when absent).
    pub streaming_quote_age: Gauge,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cycles = IntCounterVec::new(
            Opts::new(
                "price_collector_cycles_total",
                "Synchronization cycles by outcome",
            ),
            &["outcome"],
        )?;

        let snapshots_stored = IntCounter::new(
            "price_collector_snapshots_stored_total",
            "Snapshots persisted and verified",
        )?;

        let consecutive_failures = IntGauge::new(
            "price_collector_consecutive_failures",
            "Consecutive failed cycles",
        )?;

        let feed_connected = GaugeVec::new(
            Opts::new(
                "price_collector_feed_connected",
                "Feed connection status (1=connected, 0=disconnected)",
            ),
            &["source"],
        )?;

        let streaming_quote_age = Gauge::new(
            "price_collector_streaming_quote_age_seconds",
            "Age of the streaming quote when last read (-1 if none)",
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(snapshots_stored.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;
        registry.register(Box::new(feed_connected.clone()))?;
        registry.register(Box::new(streaming_quote_age.clone()))?;

        // Pre-create every outcome series.
        for outcome in CycleOutcome::ALL {
            cycles.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            cycles,
            snapshots_stored,
            consecutive_failures,
            feed_connected,
            streaming_quote_age,
        })
    }

    /// Text exposition of all registered metrics.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

impl CycleMetrics for MetricsRegistry {
    fn record_cycle(&self, outcome: CycleOutcome, consecutive_failures: u32) {
        self.cycles.with_label_values(&[outcome.as_str()]).inc();
        if outcome.is_success() {
            self.snapshots_stored.inc();
        }
        self.consecutive_failures.set(i64::from(consecutive_failures));
    }

    fn observe_feed(&self, source: &str, state: &FeedState) {
        let connected = if state.connection_state == ConnectionState::Connected {
            1.0
        } else {
            0.0
        };
        self.feed_connected.with_label_values(&[source]).set(connected);
    }

    fn observe_streaming_age(&self, age: Option<chrono::Duration>) {
        let secs = age.map_or(-1.0, |age| age.num_milliseconds() as f64 / 1000.0);
        self.streaming_quote_age.set(secs);
    }
}
