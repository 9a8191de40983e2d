//! IB Gateway Adapter
//!
//! Socket session implementing `QuoteSession` over the TWS API wire
//! protocol: handshake, contract lookup and streamed price ticks.

pub mod ib_gateway;
pub mod tws_codec;

pub use ib_gateway::{IbGatewayConfig, IbGatewaySession};
pub use tws_codec::MarketDataType;
