//! Quote and feed state types.
//!
//! A feed's bid and ask always travel together as a [`Quote`], so the
//! "bid set, ask missing" state cannot be represented. [`FeedStateCell`]
//! publishes whole [`FeedState`] values through a `watch` channel, which
//! gives readers an atomic view of `(bid, ask, updated_at)`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A two-sided price: best bid and best ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
}

impl Quote {
    pub const fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    /// Take the absolute value of both sides.
    ///
    /// Some upstream feeds report a negated price for the same level.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            bid: self.bid.abs(),
            ask: self.ask.abs(),
        }
    }

    /// Whether both sides are at or above `floor`.
    pub fn is_sane(&self, floor: Decimal) -> bool {
        self.bid >= floor && self.ask >= floor
    }
}

impl std::fmt::Display for Quote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}/{:.4}", self.bid, self.ask)
    }
}

/// Connection lifecycle of a single feed.
///
/// There is no terminal state: feeds retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Backoff => write!(f, "backoff"),
        }
    }
}

/// Point-in-time view of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedState {
    /// Latest validated quote, if any.
    pub quote: Option<Quote>,
    /// When `quote` was last written.
    pub updated_at: Option<DateTime<Utc>>,
    /// Current connection state.
    pub connection_state: ConnectionState,
}

impl FeedState {
    pub fn bid(&self) -> Option<Decimal> {
        self.quote.map(|q| q.bid)
    }

    pub fn ask(&self) -> Option<Decimal> {
        self.quote.map(|q| q.ask)
    }

    /// Age of the quote at `now`, or `None` when no quote is held.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.quote?;
        self.updated_at.map(|at| now - at)
    }

    /// A feed is stale when it holds no quote or the quote is older
    /// than `window`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.age(now) {
            Some(age) => age > window,
            None => true,
        }
    }
}

/// Single-owner cell publishing [`FeedState`] to any number of readers.
///
/// Every write replaces the whole value under the channel lock, so a
/// reader never observes a bid from one update paired with an ask from
/// another.
#[derive(Debug)]
pub struct FeedStateCell {
    tx: watch::Sender<FeedState>,
}

impl Default for FeedStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(FeedState::default());
        Self { tx }
    }

    /// Copy out the current state.
    pub fn snapshot(&self) -> FeedState {
        *self.tx.borrow()
    }

    /// Receiver that is notified on every write.
    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.tx.subscribe()
    }

    /// Store a new quote together with its timestamp.
    pub fn set_quote(&self, quote: Quote, at: DateTime<Utc>) {
        self.tx.send_modify(|state| {
            state.quote = Some(quote);
            state.updated_at = Some(at);
        });
    }

    /// Drop both sides of the quote.
    pub fn clear_quote(&self) {
        self.tx.send_modify(|state| {
            state.quote = None;
            state.updated_at = None;
        });
    }

    pub fn set_connection(&self, connection_state: ConnectionState) {
        self.tx.send_if_modified(|state| {
            if state.connection_state == connection_state {
                return false;
            }
            state.connection_state = connection_state;
            true
        });
    }
}

/// Immutable join of both feeds captured in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Single capture timestamp for both sides.
    pub captured_at: DateTime<Utc>,
    pub polled_bid: Decimal,
    pub polled_ask: Decimal,
    pub streamed_bid: Decimal,
    pub streamed_ask: Decimal,
}

impl PriceSnapshot {
    pub const fn new(captured_at: DateTime<Utc>, polled: Quote, streamed: Quote) -> Self {
        Self {
            captured_at,
            polled_bid: polled.bid,
            polled_ask: polled.ask,
            streamed_bid: streamed.bid,
            streamed_ask: streamed.ask,
        }
    }

    pub const fn polled(&self) -> Quote {
        Quote::new(self.polled_bid, self.polled_ask)
    }

    pub const fn streamed(&self) -> Quote {
        Quote::new(self.streamed_bid, self.streamed_ask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_normalized_takes_absolute_values() {
        let q = Quote::new(dec!(-17.10), dec!(17.12)).normalized();
        assert_eq!(q.bid, dec!(17.10));
        assert_eq!(q.ask, dec!(17.12));
    }

    #[test]
    fn test_is_sane_requires_both_sides() {
        let floor = dec!(2);
        assert!(Quote::new(dec!(2), dec!(2.5)).is_sane(floor));
        assert!(!Quote::new(dec!(1.5), dec!(17.12)).is_sane(floor));
        assert!(!Quote::new(dec!(17.10), dec!(1.99)).is_sane(floor));
    }

    #[test]
    fn test_empty_state_is_stale() {
        let state = FeedState::default();
        assert!(state.is_stale(at(0), chrono::Duration::seconds(30)));
        assert!(state.age(at(0)).is_none());
    }

    #[test]
    fn test_staleness_window_is_exclusive() {
        let cell = FeedStateCell::new();
        cell.set_quote(Quote::new(dec!(17.08), dec!(17.11)), at(0));
        let state = cell.snapshot();
        let window = chrono::Duration::seconds(30);

        assert!(!state.is_stale(at(5), window));
        assert!(!state.is_stale(at(30), window));
        assert!(state.is_stale(at(31), window));
    }

    #[test]
    fn test_clear_drops_both_sides() {
        let cell = FeedStateCell::new();
        cell.set_quote(Quote::new(dec!(17.08), dec!(17.11)), at(0));
        cell.clear_quote();

        let state = cell.snapshot();
        assert!(state.bid().is_none());
        assert!(state.ask().is_none());
        assert!(state.updated_at.is_none());
    }

    #[test]
    fn test_connection_state_survives_quote_writes() {
        let cell = FeedStateCell::new();
        cell.set_connection(ConnectionState::Connected);
        cell.set_quote(Quote::new(dec!(17.08), dec!(17.11)), at(0));
        cell.clear_quote();
        assert_eq!(cell.snapshot().connection_state, ConnectionState::Connected);
    }

    #[test]
    fn test_snapshot_splits_quotes() {
        let snap = PriceSnapshot::new(
            at(0),
            Quote::new(dec!(17.10), dec!(17.12)),
            Quote::new(dec!(17.08), dec!(17.11)),
        );
        assert_eq!(snap.polled_bid, dec!(17.10));
        assert_eq!(snap.streamed_ask, dec!(17.11));
        assert_eq!(snap.polled(), Quote::new(dec!(17.10), dec!(17.12)));
    }
}
