//! VALR Authentication - HMAC-SHA512 Request Signing
//!
//! Signs the WebSocket upgrade request per the VALR API. The signed
//! payload is `timestamp_ms + verb + path + body`, hex-encoded.
//! Credentials come from environment variables (VALR_API_KEY,
//! VALR_API_SECRET).

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-VALR-API-KEY";
/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-VALR-SIGNATURE";
/// Header carrying the millisecond timestamp.
pub const TIMESTAMP_HEADER: &str = "X-VALR-TIMESTAMP";

/// VALR API credentials and signer.
#[derive(Clone)]
pub struct ValrSigner {
    /// API key from VALR_API_KEY.
    api_key: String,
    /// API secret from VALR_API_SECRET (never sent).
    api_secret: String,
}

impl std::fmt::Debug for ValrSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValrSigner")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl ValrSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Load credentials from environment variables.
    ///
    /// These must be set in `.env` or the process environment, never in
    /// the config file.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("VALR_API_KEY").context("VALR_API_KEY not set")?;
        let api_secret = std::env::var("VALR_API_SECRET").context("VALR_API_SECRET not set")?;
        anyhow::ensure!(!api_key.is_empty(), "VALR_API_KEY is empty");
        anyhow::ensure!(!api_secret.is_empty(), "VALR_API_SECRET is empty");
        Ok(Self::new(api_key, api_secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hex HMAC-SHA512 of `timestamp_ms + verb + path + body`.
    pub fn sign(&self, timestamp_ms: i64, verb: &str, path: &str, body: &str) -> Result<String> {
        let mut mac = HmacSha512::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {e}"))?;
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(verb.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Header triples for a signed `GET path` at `timestamp_ms`.
    pub fn auth_headers(&self, timestamp_ms: i64, path: &str) -> Result<[(&'static str, String); 3]> {
        let signature = self.sign(timestamp_ms, "GET", path, "")?;
        Ok([
            (API_KEY_HEADER, self.api_key.clone()),
            (SIGNATURE_HEADER, signature),
            (TIMESTAMP_HEADER, timestamp_ms.to_string()),
        ])
    }
}
