//! Quote Session Port - Polled Quote Source Interface
//!
//! Models a broker session that must be connected, resolves an
//! instrument to a contract, and exposes a ticker whose bid/ask fields
//! are filled in asynchronously after a market-data request.

use async_trait::async_trait;
use rust_decimal::Decimal;

/// Instrument to resolve on the polled source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
  /// Base symbol (e.g., "USD" for USD/ZAR).
  pub symbol: String,
  /// Security type (e.g., "CASH" for forex).
  pub sec_type: String,
  /// Routing exchange (e.g., "IDEALPRO").
  pub exchange: String,
  /// Quote currency (e.g., "ZAR").
  pub currency: String,
  /// Pre-resolved contract id, skips the lookup when set.
  pub conid: Option<i64>,
}

/// Resolved contract handle returned by `qualify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractHandle {
  /// Broker contract identifier.
  pub conid: i64,
}

/// Current ticker fields. Either side may still be unpopulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ticker {
  /// Best bid, once the source has delivered it.
  pub bid: Option<Decimal>,
  /// Best ask, once the source has delivered it.
  pub ask: Option<Decimal>,
}

impl Ticker {
  /// Both sides present and non-zero.
  pub fn is_populated(&self) -> bool {
    matches!(
      (self.bid, self.ask),
      (Some(bid), Some(ask)) if !bid.is_zero() && !ask.is_zero()
    )
  }
}

impl Instrument {
  /// Forex pair routed through IDEALPRO, e.g. `forex("USD", "ZAR")`.
  pub fn forex(base: &str, quote: &str) -> Self {
    Self {
      symbol: base.to_string(),
      sec_type: "CASH".to_string(),
      exchange: "IDEALPRO".to_string(),
      currency: quote.to_string(),
      conid: None,
    }
  }
}

/// Trait for polled quote sources.
///
/// Implementors own the transport session and are bound to one
/// endpoint (host, port and client id) at construction. `is_connected` must be cheap
/// and non-blocking because it is checked between every poll.
#[async_trait]
pub trait QuoteSession: Send + Sync + 'static {
  /// Establish (or re-establish) the session with the bound endpoint.
  async fn connect(&self) -> anyhow::Result<()>;

  /// Whether the session is currently usable.
  fn is_connected(&self) -> bool;

  /// Resolve an instrument to a contract handle.
  async fn qualify(&self, instrument: &Instrument) -> anyhow::Result<ContractHandle>;

  /// Start (or refresh) market data for a contract.
  async fn request_quote(&self, contract: &ContractHandle) -> anyhow::Result<()>;

  /// Read the ticker fields as currently known to the session.
  async fn ticker(&self, contract: &ContractHandle) -> anyhow::Result<Ticker>;

  /// Tear down the session.
  async fn disconnect(&self);
}
