//! Repository Port - Snapshot Persistence Interface
//!
//! Defines the store that accepts committed price snapshots. The
//! default adapter writes append-only JSONL files; any store with an
//! insert-then-verify contract fits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::quote::PriceSnapshot;

/// A persisted snapshot with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
  /// Unique record identifier used for read-back verification.
  pub id: Uuid,
  /// Capture time (UTC).
  pub timestamp: DateTime<Utc>,
  /// Polled source bid.
  pub polled_bid: Decimal,
  /// Polled source ask.
  pub polled_ask: Decimal,
  /// Streaming source bid.
  pub streamed_bid: Decimal,
  /// Streaming source ask.
  pub streamed_ask: Decimal,
}

impl StoredSnapshot {
  /// Wrap a snapshot with a fresh id.
  pub fn from_snapshot(snapshot: &PriceSnapshot) -> Self {
    Self {
      id: Uuid::new_v4(),
      timestamp: snapshot.captured_at,
      polled_bid: snapshot.polled_bid,
      polled_ask: snapshot.polled_ask,
      streamed_bid: snapshot.streamed_bid,
      streamed_ask: snapshot.streamed_ask,
    }
  }

  /// Whether this record carries the same values as `snapshot`.
  pub fn matches(&self, snapshot: &PriceSnapshot) -> bool {
    self.timestamp == snapshot.captured_at
      && self.polled_bid == snapshot.polled_bid
      && self.polled_ask == snapshot.polled_ask
      && self.streamed_bid == snapshot.streamed_bid
      && self.streamed_ask == snapshot.streamed_ask
  }
}

/// Trait for snapshot persistence providers.
///
/// `insert` must write, then read the record back, and report `false`
/// (never an error) for anything the caller should treat as a
/// recoverable failure. The caller does not retry the same snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
  /// Persist a snapshot and verify it is readable.
  async fn insert(&self, snapshot: &PriceSnapshot) -> bool;

  /// Most recently stored snapshot, if any.
  async fn latest(&self) -> anyhow::Result<Option<StoredSnapshot>>;

  /// Check if the store is writable.
  async fn is_healthy(&self) -> bool;
}
