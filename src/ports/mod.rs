//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Traits the use cases require from the outside world. Adapters
//! implement them; tests mock them.
//!
//! Port categories:
//! - `QuoteSession`: Request/response quote source (polled)
//! - `StreamingFeed`: Long-lived push quote source
//! - `SnapshotStore`: Snapshot persistence with read-back
//! - `Escalation`: Action on sustained failure
//! - `CycleMetrics`: Cycle and feed observations
//! - `Clock`: Wall time and sleeping

pub mod clock;
pub mod escalation;
pub mod market_feed;
pub mod metrics;
pub mod quote_session;
pub mod repository;
