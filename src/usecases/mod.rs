//! Use Cases Layer - Application Logic
//!
//! Use cases:
//! - `RetrySupervisor`: Bounded exponential reconnect rounds
//! - `PolledFeedClient`: Validated quote from a request/response session
//! - `HealthTracker`: Consecutive failure counting and escalation
//! - `PriceSynchronizer`: The collection loop joining both feeds

pub mod health_tracker;
pub mod polled_feed;
pub mod price_synchronizer;
pub mod retry_supervisor;
