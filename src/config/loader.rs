//! Configuration Loader - File Loading, Overrides and Validation
//!
//! Handles loading `config.toml`, applying environment overrides, and
//! validating all parameters with clear error messages.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "PRICE_COLLECTOR_CONFIG";
/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Upper bound on every configured delay, window and timeout (one day).
const MAX_DURATION_SECS: u64 = 86_400;

/// Config path from `PRICE_COLLECTOR_CONFIG`, or `config.toml`.
pub fn config_path() -> String {
  std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Load and validate configuration from a TOML file.
///
/// # Arguments
/// * `path` - Path to the config.toml file
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - An environment override is malformed
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let mut config = parse_config(&content)?;
  apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
  validate_config(&config)?;

  info!(
    polled = %format!("{}:{}", config.polled.host, config.polled.port),
    pair = %config.streaming.pair,
    threshold = config.health.failure_threshold,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Defaults plus environment overrides, for running without a file.
pub fn default_config() -> Result<AppConfig> {
  let mut config = AppConfig::default();
  apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
  validate_config(&config)?;
  Ok(config)
}

fn parse_config(content: &str) -> Result<AppConfig> {
  toml::from_str(content).with_context(|| "Failed to parse config.toml")
}

/// Apply `IB_HOST` / `IB_PORT` / `IB_CLIENT_ID` on top of the file values.
fn apply_env_overrides(
  config: &mut AppConfig,
  lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
  if let Some(host) = lookup("IB_HOST").filter(|h| !h.trim().is_empty()) {
    config.polled.host = host.trim().to_string();
  }
  if let Some(port) = lookup("IB_PORT") {
    config.polled.port = port
      .trim()
      .parse()
      .with_context(|| format!("IB_PORT must be a port number, got {port:?}"))?;
  }
  if let Some(client_id) = lookup("IB_CLIENT_ID") {
    config.polled.client_id = client_id
      .trim()
      .parse()
      .with_context(|| format!("IB_CLIENT_ID must be an integer, got {client_id:?}"))?;
  }
  Ok(())
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Positive delays, windows and counts, with durations capped at a day
/// - A coherent backoff range and a warmup that outlasts the first backoff
/// - A known market data type
/// - A finite, positive price floor
/// - Non-empty endpoints and identifiers
fn validate_config(config: &AppConfig) -> Result<()> {
  // Polled source
  anyhow::ensure!(!config.polled.host.is_empty(), "polled.host must not be empty");
  anyhow::ensure!(config.polled.port > 0, "polled.port must be positive");
  anyhow::ensure!(
    !config.polled.symbol.is_empty() || config.polled.conid.is_some(),
    "polled.symbol or polled.conid must be set"
  );
  anyhow::ensure!(
    config.polled.max_polls > 0,
    "polled.max_polls must be positive"
  );
  anyhow::ensure!(
    config.polled.poll_interval_ms > 0,
    "polled.poll_interval_ms must be positive"
  );
  anyhow::ensure!(
    config.polled.min_price.is_finite() && config.polled.min_price > 0.0,
    "polled.min_price must be a positive number, got {}",
    config.polled.min_price
  );
  anyhow::ensure!(
    config.polled.max_reconnect_rounds > 0,
    "polled.max_reconnect_rounds must be positive"
  );
  anyhow::ensure!(
    (1..=4).contains(&config.polled.market_data_type),
    "polled.market_data_type must be 1 to 4, got {}",
    config.polled.market_data_type
  );
  anyhow::ensure!(
    config.polled.request_timeout_secs > 0,
    "polled.request_timeout_secs must be positive"
  );

  // Streaming source
  anyhow::ensure!(
    config.streaming.ws_url.starts_with("ws://") || config.streaming.ws_url.starts_with("wss://"),
    "streaming.ws_url must be a ws:// or wss:// URL, got {}",
    config.streaming.ws_url
  );
  anyhow::ensure!(!config.streaming.pair.is_empty(), "streaming.pair must not be empty");
  anyhow::ensure!(
    config.streaming.auth_timeout_secs > 0,
    "streaming.auth_timeout_secs must be positive"
  );
  anyhow::ensure!(
    config.streaming.ping_interval_secs > 0,
    "streaming.ping_interval_secs must be positive"
  );

  // Backoff
  anyhow::ensure!(
    config.retry.base_delay_secs > 0,
    "retry.base_delay_secs must be positive"
  );
  anyhow::ensure!(
    config.retry.max_delay_secs >= config.retry.base_delay_secs,
    "retry.max_delay_secs ({}) must be >= base_delay_secs ({})",
    config.retry.max_delay_secs,
    config.retry.base_delay_secs
  );
  anyhow::ensure!(
    config.retry.max_attempts_per_round > 0,
    "retry.max_attempts_per_round must be positive"
  );

  // Loop cadence
  anyhow::ensure!(
    config.sync.stale_window_secs > 0,
    "sync.stale_window_secs must be positive"
  );
  anyhow::ensure!(
    config.sync.persist_timeout_secs > 0,
    "sync.persist_timeout_secs must be positive"
  );

  anyhow::ensure!(
    config.sync.streaming_warmup_secs > config.retry.base_delay_secs,
    "sync.streaming_warmup_secs ({}) must exceed retry.base_delay_secs ({}), \
     a new streaming worker waits one base delay before connecting",
    config.sync.streaming_warmup_secs,
    config.retry.base_delay_secs
  );

  for (name, secs) in [
    ("polled.request_timeout_secs", config.polled.request_timeout_secs),
    ("retry.max_delay_secs", config.retry.max_delay_secs),
    ("retry.cooldown_secs", config.retry.cooldown_secs),
    ("sync.success_delay_secs", config.sync.success_delay_secs),
    ("sync.failure_delay_secs", config.sync.failure_delay_secs),
    ("sync.stale_window_secs", config.sync.stale_window_secs),
    ("sync.persist_timeout_secs", config.sync.persist_timeout_secs),
    ("sync.streaming_warmup_secs", config.sync.streaming_warmup_secs),
  ] {
    anyhow::ensure!(
      secs <= MAX_DURATION_SECS,
      "{name} must be at most {MAX_DURATION_SECS}, got {secs}"
    );
  }

  // Health
  anyhow::ensure!(
    config.health.failure_threshold > 0,
    "health.failure_threshold must be positive, got {}",
    config.health.failure_threshold
  );

  anyhow::ensure!(
    !config.persistence.data_dir.is_empty(),
    "persistence.data_dir must not be empty"
  );

  Ok(())
}
