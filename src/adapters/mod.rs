//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP, WebSockets, file I/O, processes).
//!
//! Adapter categories:
//! - `api`: IB Gateway socket session (TWS API)
//! - `feeds`: VALR order book WebSocket feed and auth
//! - `metrics`: Prometheus metrics export and health checks
//! - `persistence`: JSONL snapshot store
//! - `escalation`: Restart commands and shutdown on failure threshold

pub mod api;
pub mod escalation;
pub mod feeds;
pub mod metrics;
pub mod persistence;
