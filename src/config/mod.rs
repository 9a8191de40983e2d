//! Configuration Module - TOML-based Collector Configuration
//!
//! Loads and validates configuration from `config.toml` with
//! environment variable overrides via `.env` files. Every tunable has
//! a default so an empty file is a valid configuration. Credentials are
//! never read from the file.

pub mod loader;

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::adapters::api::ib_gateway::IbGatewayConfig;
use crate::adapters::api::tws_codec::MarketDataType;
use crate::adapters::feeds::valr_ws::ValrFeedConfig;
use crate::domain::retry::RetryConfig;
use crate::ports::quote_session::Instrument;
use crate::usecases::polled_feed::PolledFeedConfig;
use crate::usecases::price_synchronizer::SyncConfig;

/// Top-level collector configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
  /// Service identity and startup.
  #[serde(default)]
  pub service: ServiceConfig,
  /// Polled quote source (IB gateway).
  #[serde(default)]
  pub polled: PolledConfig,
  /// Streaming quote source (VALR).
  #[serde(default)]
  pub streaming: StreamingConfig,
  /// Reconnection backoff shared by both feeds.
  #[serde(default)]
  pub retry: RetrySettings,
  /// Synchronization loop cadence and freshness.
  #[serde(default)]
  pub sync: SyncSettings,
  /// Failure threshold and escalation.
  #[serde(default)]
  pub health: HealthConfig,
  /// Metrics and monitoring.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Persistence configuration.
  #[serde(default)]
  pub persistence: PersistenceConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  #[serde(default = "default_name")]
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Wait before the first connection so the gateway can come up.
  #[serde(default = "default_startup_delay")]
  pub startup_delay_secs: u64,
}

/// Polled source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PolledConfig {
  /// Gateway host (`IB_HOST` overrides).
  #[serde(default = "default_host")]
  pub host: String,
  /// Gateway API port (`IB_PORT` overrides).
  #[serde(default = "default_port")]
  pub port: u16,
  /// API client id (`IB_CLIENT_ID` overrides).
  #[serde(default = "default_client_id")]
  pub client_id: i32,
  /// Market data type: 1 live, 2 frozen, 3 delayed, 4 delayed-frozen.
  #[serde(default = "default_market_data_type")]
  pub market_data_type: u8,
  /// Base symbol.
  #[serde(default = "default_symbol")]
  pub symbol: String,
  /// Quote currency.
  #[serde(default = "default_currency")]
  pub currency: String,
  /// Routing exchange.
  #[serde(default = "default_exchange")]
  pub exchange: String,
  /// Security type.
  #[serde(default = "default_sec_type")]
  pub sec_type: String,
  /// Pre-resolved contract id.
  pub conid: Option<i64>,
  /// Bound on connecting and contract lookups.
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Delay between ticker reads.
  #[serde(default = "default_poll_interval")]
  pub poll_interval_ms: u64,
  /// Ticker reads per cycle.
  #[serde(default = "default_max_polls")]
  pub max_polls: u32,
  /// Minimum sane price on either side.
  #[serde(default = "default_min_price")]
  pub min_price: f64,
  /// Failed reconnect rounds before the cycle reports `ConnectionLost`.
  #[serde(default = "default_reconnect_rounds")]
  pub max_reconnect_rounds: u32,
}

/// Streaming source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
  /// WebSocket URL.
  #[serde(default = "default_ws_url")]
  pub ws_url: String,
  /// Path covered by the signature.
  #[serde(default = "default_auth_path")]
  pub auth_path: String,
  /// Currency pair.
  #[serde(default = "default_pair")]
  pub pair: String,
  /// Deadline for the auth ack.
  #[serde(default = "default_auth_timeout")]
  pub auth_timeout_secs: u64,
  /// Keep-alive period.
  #[serde(default = "default_ping_interval")]
  pub ping_interval_secs: u64,
}

/// Backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
  #[serde(default = "default_base_delay")]
  pub base_delay_secs: u64,
  #[serde(default = "default_max_delay")]
  pub max_delay_secs: u64,
  #[serde(default = "default_attempts")]
  pub max_attempts_per_round: u32,
  #[serde(default = "default_cooldown")]
  pub cooldown_secs: u64,
}

/// Synchronization loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
  /// Sleep after a successful cycle.
  #[serde(default = "default_success_delay")]
  pub success_delay_secs: u64,
  /// Sleep after any failed cycle.
  #[serde(default = "default_failure_delay")]
  pub failure_delay_secs: u64,
  /// Maximum streaming quote age.
  #[serde(default = "default_stale_window")]
  pub stale_window_secs: u64,
  /// Bound on one persistence call.
  #[serde(default = "default_persist_timeout")]
  pub persist_timeout_secs: u64,
  /// Wait after (re)starting the streaming worker.
  #[serde(default = "default_warmup")]
  pub streaming_warmup_secs: u64,
}

/// Health and escalation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
  /// Consecutive failed cycles before escalation.
  #[serde(default = "default_threshold")]
  pub failure_threshold: u32,
  /// Shell commands run on escalation.
  #[serde(default)]
  pub restart_commands: Vec<String>,
  /// Health endpoint port.
  #[serde(default = "default_health_port")]
  pub port: u16,
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Directory for JSONL snapshot files.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: default_name(),
      log_level: default_log_level(),
      startup_delay_secs: default_startup_delay(),
    }
  }
}

impl Default for PolledConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      client_id: default_client_id(),
      market_data_type: default_market_data_type(),
      symbol: default_symbol(),
      currency: default_currency(),
      exchange: default_exchange(),
      sec_type: default_sec_type(),
      conid: None,
      request_timeout_secs: default_request_timeout(),
      poll_interval_ms: default_poll_interval(),
      max_polls: default_max_polls(),
      min_price: default_min_price(),
      max_reconnect_rounds: default_reconnect_rounds(),
    }
  }
}

impl Default for StreamingConfig {
  fn default() -> Self {
    Self {
      ws_url: default_ws_url(),
      auth_path: default_auth_path(),
      pair: default_pair(),
      auth_timeout_secs: default_auth_timeout(),
      ping_interval_secs: default_ping_interval(),
    }
  }
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      base_delay_secs: default_base_delay(),
      max_delay_secs: default_max_delay(),
      max_attempts_per_round: default_attempts(),
      cooldown_secs: default_cooldown(),
    }
  }
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      success_delay_secs: default_success_delay(),
      failure_delay_secs: default_failure_delay(),
      stale_window_secs: default_stale_window(),
      persist_timeout_secs: default_persist_timeout(),
      streaming_warmup_secs: default_warmup(),
    }
  }
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      failure_threshold: default_threshold(),
      restart_commands: Vec::new(),
      port: default_health_port(),
    }
  }
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
    }
  }
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
    }
  }
}

impl AppConfig {
  /// Backoff parameters (unbounded rounds).
  pub const fn retry_config(&self) -> RetryConfig {
    RetryConfig {
      base_delay: Duration::from_secs(self.retry.base_delay_secs),
      max_delay: Duration::from_secs(self.retry.max_delay_secs),
      max_attempts_per_round: self.retry.max_attempts_per_round,
      cooldown: Duration::from_secs(self.retry.cooldown_secs),
      max_rounds: None,
    }
  }

  /// Backoff parameters for the polled session.
  pub const fn polled_retry_config(&self) -> RetryConfig {
    self
      .retry_config()
      .with_max_rounds(Some(self.polled.max_reconnect_rounds))
  }

  pub fn gateway_config(&self) -> anyhow::Result<IbGatewayConfig> {
    let market_data_type = MarketDataType::from_code(self.polled.market_data_type)
      .ok_or_else(|| anyhow::anyhow!("invalid market_data_type {}", self.polled.market_data_type))?;
    Ok(IbGatewayConfig {
      host: self.polled.host.clone(),
      port: self.polled.port,
      client_id: self.polled.client_id,
      market_data_type,
      request_timeout: Duration::from_secs(self.polled.request_timeout_secs),
    })
  }

  pub fn instrument(&self) -> Instrument {
    Instrument {
      symbol: self.polled.symbol.clone(),
      sec_type: self.polled.sec_type.clone(),
      exchange: self.polled.exchange.clone(),
      currency: self.polled.currency.clone(),
      conid: self.polled.conid,
    }
  }

  pub fn polled_feed_config(&self) -> anyhow::Result<PolledFeedConfig> {
    Ok(PolledFeedConfig {
      poll_interval: Duration::from_millis(self.polled.poll_interval_ms),
      max_polls: self.polled.max_polls,
      min_price: Decimal::try_from(self.polled.min_price)
        .map_err(|e| anyhow::anyhow!("invalid min_price {}: {e}", self.polled.min_price))?,
    })
  }

  pub fn streaming_config(&self) -> ValrFeedConfig {
    ValrFeedConfig {
      ws_url: self.streaming.ws_url.clone(),
      auth_path: self.streaming.auth_path.clone(),
      pair: self.streaming.pair.clone(),
      auth_timeout: Duration::from_secs(self.streaming.auth_timeout_secs),
      ping_interval: Duration::from_secs(self.streaming.ping_interval_secs),
    }
  }

  pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
    let stale_window = i64::try_from(self.sync.stale_window_secs)
      .ok()
      .and_then(chrono::TimeDelta::try_seconds)
      .ok_or_else(|| {
        anyhow::anyhow!("stale_window_secs {} out of range", self.sync.stale_window_secs)
      })?;
    Ok(SyncConfig {
      success_delay: Duration::from_secs(self.sync.success_delay_secs),
      failure_delay: Duration::from_secs(self.sync.failure_delay_secs),
      stale_window,
      persist_timeout: Duration::from_secs(self.sync.persist_timeout_secs),
      streaming_warmup: Duration::from_secs(self.sync.streaming_warmup_secs),
    })
  }
}

fn default_name() -> String {
  "price-collector".to_string()
}
fn default_log_level() -> String {
  "info".to_string()
}
fn default_startup_delay() -> u64 {
  60
}
fn default_host() -> String {
  "127.0.0.1".to_string()
}
fn default_port() -> u16 {
  4002
}
fn default_client_id() -> i32 {
  1
}
fn default_market_data_type() -> u8 {
  3
}
fn default_symbol() -> String {
  "USD".to_string()
}
fn default_currency() -> String {
  "ZAR".to_string()
}
fn default_exchange() -> String {
  "IDEALPRO".to_string()
}
fn default_sec_type() -> String {
  "CASH".to_string()
}
fn default_true() -> bool {
  true
}
fn default_request_timeout() -> u64 {
  10
}
fn default_poll_interval() -> u64 {
  500
}
fn default_max_polls() -> u32 {
  10
}
fn default_min_price() -> f64 {
  2.0
}
fn default_reconnect_rounds() -> u32 {
  1
}
fn default_ws_url() -> String {
  "wss://api.valr.com/ws/trade".to_string()
}
fn default_auth_path() -> String {
  "/ws/trade".to_string()
}
fn default_pair() -> String {
  "USDTZAR".to_string()
}
fn default_auth_timeout() -> u64 {
  10
}
fn default_ping_interval() -> u64 {
  30
}
fn default_base_delay() -> u64 {
  5
}
fn default_max_delay() -> u64 {
  60
}
fn default_attempts() -> u32 {
  5
}
fn default_cooldown() -> u64 {
  60
}
fn default_success_delay() -> u64 {
  15
}
fn default_failure_delay() -> u64 {
  20
}
fn default_stale_window() -> u64 {
  30
}
fn default_persist_timeout() -> u64 {
  10
}
fn default_warmup() -> u64 {
  8
}
fn default_threshold() -> u32 {
  10
}
fn default_health_port() -> u16 {
  8080
}
fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}
fn default_data_dir() -> String {
  "data".to_string()
}
