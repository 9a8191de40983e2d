//! Domain layer - Quotes, feed state and cycle outcomes.
//!
//! Pure types with no I/O. Everything here is testable in isolation.

pub mod outcome;
pub mod quote;
pub mod retry;

pub use outcome::{CycleOutcome, DataError, HealthReport, PermanentFailure, QuoteFailure, ServiceStatus};
pub use quote::{ConnectionState, FeedState, FeedStateCell, PriceSnapshot, Quote};
pub use retry::{RetryConfig, RetryPolicy};
