//! Cycle outcomes, feed failures, and the health report.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Why the polled feed could not produce a quote this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QuoteFailure {
    /// Bid and ask never populated within the poll window.
    #[error("no market data received within the poll window")]
    NoData,
    /// At least one side below the configured floor after sign normalization.
    #[error("quote below threshold: bid={bid}, ask={ask}")]
    BelowThreshold { bid: Decimal, ask: Decimal },
    /// Session unavailable or dropped mid-poll.
    #[error("connection to quote source lost")]
    ConnectionLost,
}

/// Malformed or incomplete inbound message. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("invalid message JSON: {0}")]
    Json(String),
    #[error("order book has no {0} levels")]
    MissingLevels(&'static str),
    #[error("unparseable price {0:?}")]
    InvalidPrice(String),
}

/// The supervisor exhausted its configured rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection failed after {rounds} round(s) of {attempts} attempt(s)")]
pub struct PermanentFailure {
    pub rounds: u32,
    pub attempts: u32,
}

/// Result of one synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CycleOutcome {
    Success,
    NoPolledData,
    BelowThreshold,
    ConnectionLost,
    StreamingStale,
    PersistenceFailed,
    UnexpectedError,
}

impl CycleOutcome {
    pub const ALL: [Self; 7] = [
        Self::Success,
        Self::NoPolledData,
        Self::BelowThreshold,
        Self::ConnectionLost,
        Self::StreamingStale,
        Self::PersistenceFailed,
        Self::UnexpectedError,
    ];

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable label for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoPolledData => "no_polled_data",
            Self::BelowThreshold => "below_threshold",
            Self::ConnectionLost => "connection_lost",
            Self::StreamingStale => "streaming_stale",
            Self::PersistenceFailed => "persistence_failed",
            Self::UnexpectedError => "unexpected_error",
        }
    }
}

impl From<QuoteFailure> for CycleOutcome {
    fn from(failure: QuoteFailure) -> Self {
        match failure {
            QuoteFailure::NoData => Self::NoPolledData,
            QuoteFailure::BelowThreshold { .. } => Self::BelowThreshold,
            QuoteFailure::ConnectionLost => Self::ConnectionLost,
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse service status, flipped on every recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    #[default]
    Running,
    Inactive,
}

/// Published by the health tracker after every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub last_outcome: Option<CycleOutcome>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub const fn initial(threshold: u32) -> Self {
        Self {
            status: ServiceStatus::Running,
            consecutive_failures: 0,
            threshold,
            last_outcome: None,
            last_success_at: None,
        }
    }
}
