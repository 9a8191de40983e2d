//! Health Check Server - Liveness, Readiness and Status
//!
//! Exposes /live, /ready and /status via axum 0.7. Readiness follows the
//! last `HealthReport` published by the health tracker.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument};

use crate::domain::outcome::{HealthReport, ServiceStatus};

/// Axum-based health check HTTP server.
pub struct HealthServer {
    /// Latest report from the health tracker.
    reports: watch::Receiver<HealthReport>,
    /// Bind port (default 8080 from config).
    port: u16,
}

impl HealthServer {
    /// Create a new health server.
    pub const fn new(reports: watch::Receiver<HealthReport>, port: u16) -> Self {
        Self { reports, port }
    }

    /// Routes without a listener, for serving and for tests.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .route("/status", get(Self::status))
            .with_state(self.reports.clone())
    }

    /// Start the health check server in the background.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = self.router();

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Liveness probe: always returns 200 if the process is running.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness probe: 200 while the last cycle succeeded.
    async fn readiness(State(reports): State<watch::Receiver<HealthReport>>) -> impl IntoResponse {
        if reports.borrow().status == ServiceStatus::Running {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    async fn status(State(reports): State<watch::Receiver<HealthReport>>) -> impl IntoResponse {
        let report = reports.borrow().clone();
        Json(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::CycleOutcome;

    fn status_of(response: impl IntoResponse) -> StatusCode {
        response.into_response().status()
    }

    #[test]
    fn test_readiness_follows_report() {
        let (tx, rx) = watch::channel(HealthReport::initial(10));

        let ready = tokio_test::block_on(HealthServer::readiness(State(rx.clone())));
        assert_eq!(status_of(ready), StatusCode::OK);

        tx.send_modify(|report| {
            report.status = ServiceStatus::Inactive;
            report.consecutive_failures = 1;
            report.last_outcome = Some(CycleOutcome::StreamingStale);
        });

        let not_ready = tokio_test::block_on(HealthServer::readiness(State(rx)));
        assert_eq!(status_of(not_ready), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_liveness_ignores_report() {
        let live = tokio_test::block_on(HealthServer::liveness());
        assert_eq!(status_of(live), StatusCode::OK);
    }

    #[test]
    fn test_status_serves_json() {
        let (_tx, rx) = watch::channel(HealthReport::initial(3));
        let response = tokio_test::block_on(HealthServer::status(State(rx))).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").map(|v| v.as_bytes()),
            Some(&b"application/json"[..])
        );
    }

    #[test]
    fn test_router_builds() {
        let (_tx, rx) = watch::channel(HealthReport::initial(3));
        let _router = HealthServer::new(rx, 0).router();
    }
}
