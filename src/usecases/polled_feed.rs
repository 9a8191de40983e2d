//! Polled Feed Client - Bounded Request/Validate Cycle
//!
//! Produces one validated quote per synchronization cycle, or a typed
//! failure within a bounded window:
//! 1. Reconnect through the retry supervisor if the session is down
//! 2. Qualify the instrument (cached per session) and request data
//! 3. Poll the ticker until both sides are populated or the window ends
//! 4. Normalize sign, enforce the price floor, publish to `FeedState`

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, instrument, warn};

use crate::domain::outcome::QuoteFailure;
use crate::domain::quote::{ConnectionState, FeedState, FeedStateCell, Quote};
use crate::domain::retry::RetryConfig;
use crate::ports::clock::Clock;
use crate::ports::quote_session::{ContractHandle, Instrument, QuoteSession};

use super::retry_supervisor::RetrySupervisor;

/// Poll window and validation parameters.
#[derive(Debug, Clone)]
pub struct PolledFeedConfig {
  /// Delay between ticker reads.
  pub poll_interval: Duration,
  /// Maximum ticker reads per cycle.
  pub max_polls: u32,
  /// Smallest sane price on either side.
  pub min_price: Decimal,
}

impl Default for PolledFeedConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_millis(500),
      max_polls: 10,
      min_price: dec!(2),
    }
  }
}

/// Client for the polled quote source.
///
/// Single-threaded: only the synchronizer loop drives it, so it needs
/// no internal locking beyond the published `FeedState`.
pub struct PolledFeedClient<S: QuoteSession> {
  /// Broker session port.
  session: Arc<S>,
  /// Instrument to quote.
  instrument: Instrument,
  /// Contract resolved on the current session.
  contract: Option<ContractHandle>,
  /// Reconnection policy.
  supervisor: RetrySupervisor,
  /// Time source.
  clock: Arc<dyn Clock>,
  /// Poll/validation parameters.
  config: PolledFeedConfig,
  /// Published state of this feed.
  state: FeedStateCell,
}

impl<S: QuoteSession> PolledFeedClient<S> {
  pub fn new(
    session: Arc<S>,
    instrument: Instrument,
    config: PolledFeedConfig,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      session,
      instrument,
      contract: None,
      supervisor: RetrySupervisor::new("polled", retry, Arc::clone(&clock)),
      clock,
      config,
      state: FeedStateCell::new(),
    }
  }

  pub const fn source(&self) -> &'static str {
    "polled"
  }

  /// Current state, copied out atomically.
  pub fn state(&self) -> FeedState {
    self.state.snapshot()
  }

  /// Make sure the session is usable, reconnecting if needed.
  ///
  /// # Errors
  /// `QuoteFailure::ConnectionLost` when the supervisor gives up.
  #[instrument(skip(self))]
  pub async fn ensure_connected(&mut self) -> Result<(), QuoteFailure> {
    if self.session.is_connected() {
      self.state.set_connection(ConnectionState::Connected);
      return Ok(());
    }

    warn!("Polled session disconnected, reconnecting");
    self.contract = None;
    self.state.set_connection(ConnectionState::Disconnected);

    let session = Arc::clone(&self.session);
    match self
      .supervisor
      .attempt_connect(&self.state, move || {
        let session = Arc::clone(&session);
        async move {
          session.connect().await?;
          anyhow::ensure!(session.is_connected(), "session not connected after connect");
          Ok(())
        }
      })
      .await
    {
      Ok(()) => Ok(()),
      Err(e) => {
        warn!(error = %e, "Failed to reconnect polled session");
        self.state.set_connection(ConnectionState::Disconnected);
        Err(QuoteFailure::ConnectionLost)
      }
    }
  }

  /// Fetch one validated quote.
  ///
  /// # Errors
  /// - `ConnectionLost` if the session is down or drops mid-poll
  /// - `NoData` if bid/ask never populate within the window
  /// - `BelowThreshold` if either side is under the floor; the feed
  ///   state is cleared in that case
  #[instrument(skip_all)]
  pub async fn fetch_quote(&mut self) -> Result<Quote, QuoteFailure> {
    self.ensure_connected().await?;

    let contract = match self.resolve_contract().await {
      Ok(contract) => contract,
      Err(e) => return Err(self.session_failure(&e)),
    };

    if let Err(e) = self.session.request_quote(&contract).await {
      return Err(self.session_failure(&e));
    }

    let raw = self.poll_ticker(&contract).await?;
    self.validate(raw)
  }

  async fn resolve_contract(&mut self) -> anyhow::Result<ContractHandle> {
    if let Some(contract) = self.contract {
      return Ok(contract);
    }
    let contract = self.session.qualify(&self.instrument).await?;
    debug!(conid = contract.conid, "Instrument qualified");
    self.contract = Some(contract);
    Ok(contract)
  }

  /// Read the ticker at a fixed interval until both sides arrive.
  async fn poll_ticker(&mut self, contract: &ContractHandle) -> Result<Quote, QuoteFailure> {
    for poll in 1..=self.config.max_polls {
      if !self.session.is_connected() {
        warn!(poll, "Polled session dropped while waiting for data");
        return Err(self.connection_lost());
      }

      self.clock.sleep(self.config.poll_interval).await;

      match self.session.ticker(contract).await {
        Ok(ticker) if ticker.is_populated() => {
          if let (Some(bid), Some(ask)) = (ticker.bid, ticker.ask) {
            debug!(poll, %bid, %ask, "Market data received");
            return Ok(Quote::new(bid, ask));
          }
        }
        Ok(_) => debug!(poll, "Ticker not populated yet"),
        Err(e) => return Err(self.session_failure(&e)),
      }
    }

    if self.session.is_connected() {
      warn!(polls = self.config.max_polls, "No market data received");
      Err(QuoteFailure::NoData)
    } else {
      Err(self.connection_lost())
    }
  }

  fn validate(&self, raw: Quote) -> Result<Quote, QuoteFailure> {
    let quote = raw.normalized();
    if quote != raw {
      debug!(raw = %raw, normalized = %quote, "Normalized negated quote");
    }

    if !quote.is_sane(self.config.min_price) {
      self.state.clear_quote();
      info!(
        bid = %quote.bid,
        ask = %quote.ask,
        floor = %self.config.min_price,
        "Invalid polled prices detected, not storing"
      );
      return Err(QuoteFailure::BelowThreshold {
        bid: quote.bid,
        ask: quote.ask,
      });
    }

    self.state.set_quote(quote, self.clock.now());
    Ok(quote)
  }

  /// Map a session error: a dropped session is `ConnectionLost`,
  /// anything else is treated as missing data.
  fn session_failure(&mut self, error: &anyhow::Error) -> QuoteFailure {
    if self.session.is_connected() {
      warn!(error = %error, "Polled request failed");
      QuoteFailure::NoData
    } else {
      warn!(error = %error, "Polled session lost during request");
      self.connection_lost()
    }
  }

  fn connection_lost(&mut self) -> QuoteFailure {
    self.contract = None;
    self.state.set_connection(ConnectionState::Disconnected);
    QuoteFailure::ConnectionLost
  }
}
