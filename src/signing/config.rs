//! Signing configuration as it appears in a static exchange spec.

use serde::Deserialize;

use crate::auth::{Digest, Encoding, SecretEncoding};
use crate::error::ConfigError;

/// The closed set of signing patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningPattern {
    HmacSha256Headers,
    HmacSha256Query,
    HmacSha256IsoPassphrase,
    HmacSha256Kucoin,
    HmacSha512Nonce,
    HmacSha512Gate,
    HmacSha384Payload,
    Deribit,
    WsDirectHmacExpiry,
    WsInlineSubscribe,
    WsIsoPassphrase,
    WsJsonRpcLinebreak,
    WsListenKey,
    WsRestToken,
    Custom,
}

impl SigningPattern {
    pub const ALL: [Self; 15] = [
        Self::HmacSha256Headers,
        Self::HmacSha256Query,
        Self::HmacSha256IsoPassphrase,
        Self::HmacSha256Kucoin,
        Self::HmacSha512Nonce,
        Self::HmacSha512Gate,
        Self::HmacSha384Payload,
        Self::Deribit,
        Self::WsDirectHmacExpiry,
        Self::WsInlineSubscribe,
        Self::WsIsoPassphrase,
        Self::WsJsonRpcLinebreak,
        Self::WsListenKey,
        Self::WsRestToken,
        Self::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha256Headers => "hmac_sha256_headers",
            Self::HmacSha256Query => "hmac_sha256_query",
            Self::HmacSha256IsoPassphrase => "hmac_sha256_iso_passphrase",
            Self::HmacSha256Kucoin => "hmac_sha256_kucoin",
            Self::HmacSha512Nonce => "hmac_sha512_nonce",
            Self::HmacSha512Gate => "hmac_sha512_gate",
            Self::HmacSha384Payload => "hmac_sha384_payload",
            Self::Deribit => "deribit",
            Self::WsDirectHmacExpiry => "ws_direct_hmac_expiry",
            Self::WsInlineSubscribe => "ws_inline_subscribe",
            Self::WsIsoPassphrase => "ws_iso_passphrase",
            Self::WsJsonRpcLinebreak => "ws_jsonrpc_linebreak",
            Self::WsListenKey => "ws_listen_key",
            Self::WsRestToken => "ws_rest_token",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for SigningPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownPattern(s.to_string()))
    }
}

impl std::fmt::Display for SigningPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a nonce-body signature covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoncePayload {
    /// `path + SHA256(nonce + body)`, the Kraken spot scheme
    PathSha256,
    /// The urlencoded body alone
    Body,
}

/// Placement of the SHA-384 JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadVariant {
    /// Payload in headers and also sent as the JSON body
    Bitfinex,
    /// Payload only in headers, empty body
    Gemini,
}

/// What an inline WebSocket signature covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineMode {
    /// `timestamp + method + path`
    #[default]
    Request,
    /// `timestamp + channel + symbols`
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Seconds,
    #[default]
    Millis,
}

impl TimestampUnit {
    pub fn from_ms(self, ms: u64) -> u64 {
        match self {
            Self::Seconds => ms / 1_000,
            Self::Millis => ms,
        }
    }
}

/// A fixed header name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

/// Per-exchange signing configuration.
///
/// `pattern` selects the algorithm; every other field is an optional override
/// of that pattern's defaults.
///
/// ```rust
/// use exchange_pipeline::signing::SigningConfig;
///
/// let config: SigningConfig = serde_json::from_str(
///     r#"{ "pattern": "hmac_sha256_query", "recv_window": 5000 }"#,
/// ).unwrap();
/// assert_eq!(config.pattern, "hmac_sha256_query");
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub pattern: String,
    pub api_key_header: Option<String>,
    pub signature_header: Option<String>,
    pub timestamp_header: Option<String>,
    pub passphrase_header: Option<String>,
    pub payload_header: Option<String>,
    pub recv_window_header: Option<String>,
    pub recv_window: Option<u64>,
    pub digest: Option<Digest>,
    pub encoding: Option<Encoding>,
    pub secret_encoding: Option<SecretEncoding>,
    pub signature_param: Option<String>,
    pub timestamp_param: Option<String>,
    pub signing_path_prefix: Option<String>,
    pub nonce_payload: Option<NoncePayload>,
    pub variant: Option<PayloadVariant>,
    pub sandbox_header: Option<HeaderPair>,
    pub inline_mode: Option<InlineMode>,
    pub timestamp_unit: Option<TimestampUnit>,
    pub expires_after_ms: Option<u64>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub refresh_interval_ms: Option<u64>,
    pub custom_signer: Option<String>,
}

impl SigningConfig {
    /// A config selecting `pattern` with all defaults.
    pub fn for_pattern(pattern: SigningPattern) -> Self {
        Self {
            pattern: pattern.as_str().to_string(),
            ..Self::default()
        }
    }

    /// Resolve the pattern name.
    pub fn pattern(&self) -> Result<SigningPattern, ConfigError> {
        self.pattern.parse()
    }
}

/// `value` or the pattern default.
pub(crate) fn header_or(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_string())
}
