//! Market Data Feed Adapters - Real-time Price Streaming
//!
//! - `valr_auth`: HMAC-SHA512 request signing
//! - `valr_protocol`: Message codec and session state machine
//! - `valr_ws`: Supervised WebSocket worker implementing `StreamingFeed`

pub mod valr_auth;
pub mod valr_protocol;
pub mod valr_ws;

pub use valr_auth::ValrSigner;
pub use valr_ws::{ValrFeed, ValrFeedConfig};
