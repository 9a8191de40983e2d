//! VALR WebSocket Feed - Streaming USDT/ZAR Order Book
//!
//! Maintains one authenticated subscription to the VALR trade socket
//! and keeps a `FeedState` current with the best bid/ask. Implements
//! the `StreamingFeed` port so the synchronizer never sees transport
//! details.
//!
//! Features:
//! - Signed upgrade request (HMAC-SHA512), ack-gated subscribe
//! - Reconnect through `RetrySupervisor` (infinite rounds)
//! - PING keep-alive, reset on demand, clean close on shutdown
//! - Event-driven via tokio::select! with `biased;` shutdown priority

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::quote::{ConnectionState, FeedState, FeedStateCell};
use crate::domain::retry::RetryConfig;
use crate::ports::clock::Clock;
use crate::ports::market_feed::StreamingFeed;
use crate::usecases::retry_supervisor::RetrySupervisor;

use super::valr_auth::ValrSigner;
use super::valr_protocol::{self, Action, SessionProtocol};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on waiting for the worker after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connection parameters for the VALR socket.
#[derive(Debug, Clone)]
pub struct ValrFeedConfig {
    /// WebSocket URL.
    pub ws_url: String,
    /// Path covered by the signature.
    pub auth_path: String,
    /// Currency pair to subscribe to.
    pub pair: String,
    /// Deadline for the AUTHENTICATED ack.
    pub auth_timeout: Duration,
    /// Keep-alive period.
    pub ping_interval: Duration,
}

impl Default for ValrFeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.valr.com/ws/trade".to_string(),
            auth_path: "/ws/trade".to_string(),
            pair: "USDTZAR".to_string(),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// How a streaming session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Reset,
    Lost(anyhow::Error),
}

/// State shared between the handle and its worker task.
struct Inner {
    config: ValrFeedConfig,
    signer: ValrSigner,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    state: FeedStateCell,
    reset_tx: mpsc::Sender<()>,
    /// Held by the running worker for its whole lifetime.
    reset_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

/// VALR streaming feed adapter.
///
/// At most one worker task exists at a time, so reconnects never run
/// concurrently with each other.
pub struct ValrFeed {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ValrFeed {
    pub fn new(
        config: ValrFeedConfig,
        signer: ValrSigner,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                config,
                signer,
                // The streaming side never gives up.
                retry: retry.with_max_rounds(None),
                clock,
                state: FeedStateCell::new(),
                reset_tx,
                reset_rx: tokio::sync::Mutex::new(reset_rx),
                shutdown_tx,
                stopped: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<FeedState> {
        self.inner.state.subscribe()
    }
}

#[async_trait]
impl StreamingFeed for ValrFeed {
    fn source(&self) -> &'static str {
        "streaming"
    }

    fn ensure_running(&self) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return false;
            }
            warn!(pair = %self.inner.config.pair, "Streaming worker has exited, restarting");
        }

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        *worker = Some(tokio::spawn(inner.run(shutdown_rx)));
        info!(pair = %self.inner.config.pair, "Streaming worker started");
        true
    }

    fn state(&self) -> FeedState {
        self.inner.state.snapshot()
    }

    async fn reset(&self) {
        self.inner.state.clear_quote();
        match self.inner.reset_tx.try_send(()) {
            Ok(()) => info!("Streaming reset requested"),
            Err(mpsc::error::TrySendError::Full(())) => debug!("Streaming reset already pending"),
            Err(mpsc::error::TrySendError::Closed(())) => warn!("Streaming reset channel closed"),
        }
    }

    async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _ = self.inner.shutdown_tx.send(());

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => info!("Streaming worker stopped"),
                Ok(Err(e)) => error!(error = %e, "Streaming worker panicked"),
                Err(_) => {
                    warn!("Streaming worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.inner.state.set_connection(ConnectionState::Disconnected);
    }
}

impl Inner {
    /// Worker loop: connect, stream, repeat until shutdown.
    #[instrument(skip_all)]
    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut reset_rx = self.reset_rx.lock().await;
        let mut supervisor = RetrySupervisor::new("streaming", self.retry, Arc::clone(&self.clock));

        loop {
            let this = Arc::clone(&self);
            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = supervisor.attempt_connect(&self.state, move || {
                    let this = Arc::clone(&this);
                    async move { this.open_session().await }
                }) => result,
            };

            let (ws, protocol) = match connected {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "Streaming supervisor gave up, starting over");
                    continue;
                }
            };

            // Requests made while disconnected are satisfied by the fresh session.
            while reset_rx.try_recv().is_ok() {}

            match self.stream(ws, protocol, &mut shutdown_rx, &mut reset_rx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Reset => info!("Streaming session reset, resubscribing"),
                SessionEnd::Lost(e) => {
                    warn!(error = %e, "Streaming connection lost, reconnecting");
                    self.state.set_connection(ConnectionState::Backoff);
                }
            }
        }

        self.state.set_connection(ConnectionState::Disconnected);
        info!("Streaming worker shut down gracefully");
    }

    /// Open the socket, wait for the auth ack, and subscribe.
    async fn open_session(&self) -> Result<(WsStream, SessionProtocol)> {
        let timestamp = self.clock.now().timestamp_millis();

        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .context("Invalid VALR WebSocket URL")?;

        for (name, value) in self.signer.auth_headers(timestamp, &self.config.auth_path)? {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).context("Invalid header name")?,
                HeaderValue::from_str(&value).context("Invalid header value")?,
            );
        }

        let (mut ws, _) = connect_async(request)
            .await
            .context("VALR WebSocket connection failed")?;

        let mut protocol = SessionProtocol::new(self.config.pair.clone());

        match tokio::time::timeout(
            self.config.auth_timeout,
            Self::await_authenticated(&mut ws, &mut protocol),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws.close(None).await;
                anyhow::bail!(
                    "authentication not acknowledged within {}s",
                    self.config.auth_timeout.as_secs()
                );
            }
        }

        ws.send(Message::Text(valr_protocol::subscribe(&self.config.pair)))
            .await
            .context("Failed to send subscribe")?;

        info!(pair = %self.config.pair, "VALR authenticated, subscribed to order book");
        Ok((ws, protocol))
    }

    async fn await_authenticated(ws: &mut WsStream, protocol: &mut SessionProtocol) -> Result<()> {
        while let Some(msg) = ws.next().await {
            match msg.context("WebSocket error during authentication")? {
                Message::Text(text) => match protocol.on_text(&text) {
                    Ok(Action::Subscribe) => return Ok(()),
                    Ok(_) => debug!("Message before authentication ignored"),
                    Err(e) => debug!(error = %e, "Unparseable message before authentication"),
                },
                Message::Close(frame) => anyhow::bail!("closed during authentication: {frame:?}"),
                _ => {}
            }
        }
        anyhow::bail!("stream ended before authentication")
    }

    /// Single streaming session: read updates until error, reset or shutdown.
    async fn stream(
        &self,
        mut ws: WsStream,
        mut protocol: SessionProtocol,
        shutdown_rx: &mut broadcast::Receiver<()>,
        reset_rx: &mut mpsc::Receiver<()>,
    ) -> SessionEnd {
        let period = self.config.ping_interval;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received in streaming feed");
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
                Some(()) = reset_rx.recv() => {
                    if let Err(e) = ws.send(Message::Text(valr_protocol::unsubscribe())).await {
                        debug!(error = %e, "Unsubscribe failed during reset");
                    }
                    let _ = ws.close(None).await;
                    self.state.clear_quote();
                    self.state.set_connection(ConnectionState::Disconnected);
                    return SessionEnd::Reset;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = ws.send(Message::Text(valr_protocol::ping())).await {
                        return SessionEnd::Lost(anyhow::anyhow!("keep-alive failed: {e}"));
                    }
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.on_text(&mut protocol, &text),
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Lost(anyhow::anyhow!("closed by server: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return SessionEnd::Lost(anyhow::anyhow!("WebSocket error: {e}"));
                        }
                        None => {
                            return SessionEnd::Lost(anyhow::anyhow!("WebSocket stream ended"));
                        }
                    }
                }
            }
        }
    }

    fn on_text(&self, protocol: &mut SessionProtocol, text: &str) {
        apply_frame(&self.state, protocol, text, self.clock.now());
    }
}

/// Apply one inbound frame to `state`. Data errors drop the frame.
fn apply_frame(
    state: &FeedStateCell,
    protocol: &mut SessionProtocol,
    text: &str,
    now: chrono::DateTime<chrono::Utc>,
) {
    match protocol.on_text(text) {
        Ok(Action::Publish(quote)) => {
            state.set_quote(quote, now);
            debug!(bid = %quote.bid, ask = %quote.ask, "Streaming quote updated");
        }
        Ok(Action::Subscribe | Action::Ignore) => {}
        Err(e) => warn!(error = %e, "Dropping malformed streaming message"),
    }
}
