//! VALR WebSocket Protocol - Message Types and Parsing
//!
//! Inbound messages are tagged by `type`. Only the handshake ack, the
//! aggregated order book, and keep-alive replies matter here; anything
//! else decodes to `Inbound::Other` and is ignored.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::outcome::DataError;
use crate::domain::quote::Quote;

/// Order book event name used in subscriptions and updates.
pub const ORDERBOOK_EVENT: &str = "AGGREGATED_ORDERBOOK_UPDATE";

/// Inbound message from the trade socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "AUTHENTICATED")]
    Authenticated,
    #[serde(rename = "AGGREGATED_ORDERBOOK_UPDATE")]
    OrderBook(OrderBookUpdate),
    #[serde(rename = "PONG")]
    Pong,
    #[serde(other)]
    Other,
}

/// Aggregated order book update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderBookUpdate {
    /// Pair the update belongs to.
    #[serde(rename = "currencyPairSymbol", default)]
    pub pair: Option<String>,
    /// Price levels.
    pub data: OrderBookData,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderBookData {
    /// Bid levels, best first.
    #[serde(rename = "Bids", default)]
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    #[serde(rename = "Asks", default)]
    pub asks: Vec<PriceLevel>,
}

/// One aggregated price level.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriceLevel {
    /// Price as string.
    pub price: String,
    /// Quantity as string.
    #[serde(default)]
    pub quantity: Option<String>,
}

impl OrderBookUpdate {
    /// Whether this update is for `pair` (updates without a pair are
    /// accepted, the socket only carries subscribed pairs).
    pub fn is_for(&self, pair: &str) -> bool {
        self.pair.as_deref().is_none_or(|p| p.eq_ignore_ascii_case(pair))
    }

    /// Best bid and ask from the first level of each side.
    ///
    /// Both sides must be present; a one-sided book is a `DataError`.
    pub fn best_quote(&self) -> Result<Quote, DataError> {
        let bid = self
            .data
            .bids
            .first()
            .ok_or(DataError::MissingLevels("Bids"))?;
        let ask = self
            .data
            .asks
            .first()
            .ok_or(DataError::MissingLevels("Asks"))?;
        Ok(Quote::new(parse_price(&bid.price)?, parse_price(&ask.price)?))
    }
}

fn parse_price(raw: &str) -> Result<Decimal, DataError> {
    Decimal::from_str(raw.trim()).map_err(|_| DataError::InvalidPrice(raw.to_string()))
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<Inbound, DataError> {
    serde_json::from_str(text).map_err(|e| DataError::Json(e.to_string()))
}

#[derive(Debug, Serialize)]
struct Subscription<'a> {
    event: &'static str,
    pairs: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    subscriptions: [Subscription<'a>; 1],
}

fn subscription_message(pairs: Vec<&str>) -> String {
    let msg = SubscribeMessage {
        kind: "SUBSCRIBE",
        subscriptions: [Subscription {
            event: ORDERBOOK_EVENT,
            pairs,
        }],
    };
    // A struct of strings always serializes.
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Subscribe to the aggregated order book for `pair`.
pub fn subscribe(pair: &str) -> String {
    subscription_message(vec![pair])
}

/// Unsubscribe: the same message with an empty pair list.
pub fn unsubscribe() -> String {
    subscription_message(Vec::new())
}

/// Application-level keep-alive.
pub fn ping() -> String {
    r#"{"type":"PING"}"#.to_string()
}

/// What the socket task should do after a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send the subscribe message.
    Subscribe,
    /// Publish a new best quote.
    Publish(Quote),
    /// Nothing to do.
    Ignore,
}

/// Per-connection protocol state.
///
/// Turns inbound frames into actions without touching the transport, so
/// the handshake and parsing rules are testable on their own.
#[derive(Debug, Clone)]
pub struct SessionProtocol {
    pair: String,
    subscribed: bool,
}

impl SessionProtocol {
    pub fn new(pair: impl Into<String>) -> Self {
        Self {
            pair: pair.into(),
            subscribed: false,
        }
    }

    pub const fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Handle one text frame.
    ///
    /// # Errors
    /// `DataError` for malformed JSON or an unusable order book. The
    /// caller drops the frame and keeps the connection.
    pub fn on_text(&mut self, text: &str) -> Result<Action, DataError> {
        match decode(text)? {
            Inbound::Authenticated if !self.subscribed => {
                self.subscribed = true;
                Ok(Action::Subscribe)
            }
            Inbound::OrderBook(update) if update.is_for(&self.pair) => {
                update.best_quote().map(Action::Publish)
            }
            Inbound::Authenticated | Inbound::OrderBook(_) | Inbound::Pong | Inbound::Other => {
                Ok(Action::Ignore)
            }
        }
    }
}
