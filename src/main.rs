//! Price Collector - Entry Point
//!
//! Initializes configuration, logging, both quote feeds and the
//! synchronization loop. Runs until SIGINT/SIGTERM or escalation.
//!
//! Wiring sequence:
//! 1. Load `.env`, then config.toml (defaults when the file is absent)
//! 2. Init tracing (JSON structured logging)
//! 3. Spawn health server and Prometheus exporter (both joined on shutdown)
//! 4. Wait out the startup delay so the gateway can come up
//! 5. Create the IB gateway session and the VALR feed (creds from env)
//! 6. Create the JSONL snapshot store and the health tracker
//! 7. Spawn the price synchronizer loop
//! 8. Wait for SIGINT/SIGTERM or escalation, then shut down in order

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use price_collector::adapters::api::IbGatewaySession;
use price_collector::adapters::escalation::RestartEscalation;
use price_collector::adapters::feeds::{ValrFeed, ValrSigner};
use price_collector::adapters::metrics::{HealthServer, MetricsRegistry};
use price_collector::adapters::persistence::JsonlSnapshotStore;
use price_collector::config::loader::{config_path, default_config, load_config};
use price_collector::ports::clock::{Clock, SystemClock};
use price_collector::ports::market_feed::StreamingFeed;
use price_collector::ports::quote_session::QuoteSession;
use price_collector::usecases::health_tracker::HealthTracker;
use price_collector::usecases::polled_feed::PolledFeedClient;
use price_collector::usecases::price_synchronizer::PriceSynchronizer;

/// Bound on each monitoring server's exit after shutdown.
const SERVER_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment and configuration ────────────────────
    let dotenv_loaded = dotenvy::dotenv().is_ok();

    let path = config_path();
    let from_file = Path::new(&path).exists();
    let config = if from_file {
        load_config(&path).context("Failed to load configuration")?
    } else {
        default_config().context("Invalid default configuration")?
    };

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    if !from_file {
        warn!(path = %path, "Config file not found, using defaults");
    }

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        dotenv = dotenv_loaded,
        polled = %format!("{}:{}", config.polled.host, config.polled.port),
        client_id = config.polled.client_id,
        pair = %config.streaming.pair,
        "Starting price collector"
    );

    // ── 3. Shutdown channel, escalation, monitoring ─────────
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(4);

    let escalation = Arc::new(RestartEscalation::new(
        config.health.restart_commands.clone(),
        shutdown_tx.clone(),
    ));
    let escalated = escalation.escalated_flag();
    let health = HealthTracker::new(config.health.failure_threshold, escalation);

    let health_server = HealthServer::new(health.subscribe(), config.health.port);
    let health_handle = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move {
            if let Err(e) = health_server.run(shutdown).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    let (metrics, metrics_handle) = if config.metrics.enabled {
        let registry = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
        let bind_address = config.metrics.bind_address.clone();
        let shutdown = shutdown_tx.subscribe();
        let server = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(bind_address, shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    // ── 4. Startup delay ────────────────────────────────────
    let startup_delay = Duration::from_secs(config.service.startup_delay_secs);
    if !startup_delay.is_zero() {
        info!(secs = startup_delay.as_secs(), "Waiting before first connection");
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("SIGINT received during startup delay");
                let _ = shutdown_tx.send(());
                join_servers(health_handle, metrics_handle, SERVER_GRACE).await;
                return Ok(());
            }
            () = tokio::time::sleep(startup_delay) => {}
        }
    }

    // ── 5. Quote sources ────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let session = Arc::new(IbGatewaySession::new(
        config.gateway_config().context("Invalid IB gateway configuration")?,
    ));
    let polled = PolledFeedClient::new(
        Arc::clone(&session),
        config.instrument(),
        config.polled_feed_config()?,
        config.polled_retry_config(),
        Arc::clone(&clock),
    );

    let signer = ValrSigner::from_env().context("Failed to load VALR credentials from env")?;
    let feed = Arc::new(ValrFeed::new(
        config.streaming_config(),
        signer,
        config.retry_config(),
        Arc::clone(&clock),
    ));

    // ── 6. Persistence ──────────────────────────────────────
    let store = Arc::new(
        JsonlSnapshotStore::new(&config.persistence.data_dir)
            .await
            .context("Failed to create snapshot store")?,
    );

    // ── 7. Spawn the synchronizer ───────────────────────────
    let mut synchronizer = PriceSynchronizer::new(
        polled,
        Arc::clone(&feed),
        store,
        health,
        clock,
        config.sync_config().context("Invalid sync configuration")?,
    );
    if let Some(registry) = metrics {
        synchronizer = synchronizer.with_metrics(registry);
    }

    let sync_shutdown = shutdown_tx.subscribe();
    let sync_handle = tokio::spawn(async move {
        synchronizer.run(sync_shutdown).await;
    });

    info!("All tasks spawned, collector is running");

    // ── 8. Wait for a signal or escalation ──────────────────
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received, initiating graceful shutdown");
        }
        () = terminate() => {
            info!("SIGTERM received, initiating graceful shutdown");
        }
        _ = shutdown_rx.recv() => {
            warn!("Shutdown requested by escalation");
        }
    }

    // 1. Signal all tasks to stop
    let _ = shutdown_tx.send(());

    // 2. Let the synchronizer finish its cycle (up to 30s)
    if tokio::time::timeout(Duration::from_secs(30), sync_handle).await.is_err() {
        warn!("Synchronizer did not stop in time");
    }

    // 3. Close both feeds
    feed.shutdown().await;
    session.disconnect().await;

    // 4. Stop health and metrics servers
    join_servers(health_handle, metrics_handle, SERVER_GRACE).await;

    if escalated.load(Ordering::Acquire) {
        error!("Exiting after escalation");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait (bounded) for the monitoring servers after the shutdown broadcast.
///
/// Returns how many servers had to be aborted.
async fn join_servers(
    health: JoinHandle<()>,
    metrics: Option<JoinHandle<()>>,
    grace: Duration,
) -> usize {
    let handles = std::iter::once(("health", health)).chain(metrics.map(|h| ("metrics", h)));
    let mut aborted = 0;
    for (name, mut handle) in handles {
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(server = name, "Server did not stop in time, aborting");
            handle.abort();
            aborted += 1;
        }
    }
    aborted
}

/// Resolves on SIGTERM (never on non-unix targets).
#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
