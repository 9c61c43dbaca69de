//! Static per-exchange configuration.
//!
//! An [`ExchangeSpec`] is plain data deserialized from JSON. [`Exchange`] is
//! the validated form the pipeline works with: URLs parsed, headers checked,
//! signing pattern resolved. Everything that can be wrong with a spec is
//! reported here, once, as a [`ConfigError`].
//!
//! ```rust
//! use exchange_pipeline::exchange::Exchange;
//! use exchange_pipeline::signing::CustomSigners;
//!
//! let exchange = Exchange::from_json(r#"{
//!     "id": "binance",
//!     "urls": {
//!         "api": { "rest": "https://api.binance.com" },
//!         "sandbox": { "rest": "https://testnet.binance.vision" }
//!     },
//!     "signing": { "pattern": "hmac_sha256_query", "recv_window": 5000 },
//!     "rate_limits": { "requests": 1200, "period": 60000 },
//!     "response_error": { "type": "error_code_field", "field": "code", "message_field": "msg" },
//!     "error_codes": { "-2010": { "type": "insufficient_balance" } }
//! }"#, &CustomSigners::new()).unwrap();
//!
//! assert_eq!(exchange.base_url(None, true).unwrap(), "https://testnet.binance.vision");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};

use crate::auth::{IncreasingNonce, NonceProvider};
use crate::error::{ConfigError, ErrorCodeTable};
use crate::rate_limit::LimitConfig;
use crate::response::ResponseErrorRule;
use crate::signing::{CustomSigners, Signer, SigningConfig};

/// URL key used when a request does not name one.
pub const DEFAULT_URL_KEY: &str = "rest";

/// Live and sandbox base URLs, keyed by API section (`rest`, `public`, `private`...).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlTable {
    pub api: BTreeMap<String, String>,
    #[serde(default)]
    pub sandbox: BTreeMap<String, String>,
}

impl UrlTable {
    /// Resolve `key` (or the default) in the live or sandbox table.
    ///
    /// A single-entry table answers for the default key. Sandbox lookups
    /// never fall back to live URLs.
    pub fn resolve(&self, key: Option<&str>, sandbox: bool) -> Option<&str> {
        let table = if sandbox { &self.sandbox } else { &self.api };
        match key {
            Some(key) => table.get(key),
            None => table
                .get(DEFAULT_URL_KEY)
                .or_else(|| (table.len() == 1).then(|| table.values().next()).flatten()),
        }
        .map(String::as_str)
    }
}

/// Broker attribution header sent on every request.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerHeader {
    pub header: String,
    pub id: String,
}

/// An exchange spec as written in JSON.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSpec {
    pub id: String,
    pub urls: UrlTable,
    #[serde(default)]
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub rate_limits: Option<LimitConfig>,
    #[serde(default)]
    pub error_codes: ErrorCodeTable,
    #[serde(default)]
    pub response_error: Option<ResponseErrorRule>,
    /// Static headers sent with unsigned requests
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub broker: Option<BrokerHeader>,
    /// Default per-request timeout
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "timeout_ms")]
    pub timeout: Option<Duration>,
}

/// A validated exchange.
pub struct Exchange {
    spec: ExchangeSpec,
    signer: Option<Signer>,
    headers: HeaderMap,
    nonce: Arc<dyn NonceProvider>,
}

impl Exchange {
    /// Validate `spec`.
    pub fn from_spec(spec: ExchangeSpec, custom: &CustomSigners) -> Result<Self, ConfigError> {
        if spec.id.trim().is_empty() {
            return Err(ConfigError::InvalidSpec("empty exchange id".to_string()));
        }
        if spec.urls.api.is_empty() {
            return Err(ConfigError::MissingUrl {
                exchange: spec.id.clone(),
                key: DEFAULT_URL_KEY.to_string(),
            });
        }
        for url in spec.urls.api.values().chain(spec.urls.sandbox.values()) {
            url::Url::parse(url)?;
        }

        let signer = spec
            .signing
            .as_ref()
            .map(|config| Signer::from_config(config, custom))
            .transpose()?;

        if let Some(limit) = &spec.rate_limits {
            limit.validate()?;
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            headers.insert(parse_name(name)?, parse_value(name, value)?);
        }
        if let Some(broker) = &spec.broker {
            headers.insert(parse_name(&broker.header)?, parse_value(&broker.header, &broker.id)?);
        }
        if let Some(agent) = &spec.user_agent {
            headers.insert(reqwest::header::USER_AGENT, parse_value("user-agent", agent)?);
        }

        tracing::debug!(
            exchange = %spec.id,
            signing = ?signer.as_ref().map(Signer::pattern),
            rate_limit = ?spec.rate_limits,
            "loaded exchange spec"
        );

        Ok(Self {
            spec,
            signer,
            headers,
            nonce: Arc::new(IncreasingNonce::new()),
        })
    }

    /// Parse and validate a JSON spec.
    pub fn from_json(json: &str, custom: &CustomSigners) -> Result<Self, ConfigError> {
        Self::from_spec(serde_json::from_str(json)?, custom)
    }

    /// Replace the nonce provider.
    pub fn with_nonce(mut self, nonce: Arc<dyn NonceProvider>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ExchangeSpec {
        &self.spec
    }

    pub fn signer(&self) -> Option<&Signer> {
        self.signer.as_ref()
    }

    pub fn rate_limit(&self) -> Option<&LimitConfig> {
        self.spec.rate_limits.as_ref()
    }

    pub fn error_codes(&self) -> &ErrorCodeTable {
        &self.spec.error_codes
    }

    pub fn response_error(&self) -> Option<&ResponseErrorRule> {
        self.spec.response_error.as_ref()
    }

    /// Static, broker and user-agent headers, validated.
    pub fn static_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.spec.timeout
    }

    pub fn nonce(&self) -> Arc<dyn NonceProvider> {
        Arc::clone(&self.nonce)
    }

    /// Base URL for `key`, from the sandbox table when `sandbox` is set.
    pub fn base_url(&self, key: Option<&str>, sandbox: bool) -> Result<&str, ConfigError> {
        self.spec
            .urls
            .resolve(key, sandbox)
            .ok_or_else(|| ConfigError::MissingUrl {
                exchange: self.spec.id.clone(),
                key: format!(
                    "{}{}",
                    if sandbox { "sandbox." } else { "" },
                    key.unwrap_or(DEFAULT_URL_KEY)
                ),
            })
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.spec.id)
            .field("signer", &self.signer)
            .field("rate_limit", &self.spec.rate_limits)
            .finish()
    }
}

fn parse_name(name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidHeader(name.to_string()))
}

/// Header values must be visible ASCII so they can be copied onto signed
/// requests as text.
fn parse_value(name: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value)
        .ok()
        .filter(|header| header.to_str().is_ok())
        .ok_or_else(|| ConfigError::InvalidHeader(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::SigningPattern;

    const OKX: &str = r#"{
        "id": "okx",
        "urls": { "api": { "rest": "https://www.okx.com" } },
        "signing": {
            "pattern": "hmac_sha256_iso_passphrase",
            "sandbox_header": { "name": "x-simulated-trading", "value": "1" }
        },
        "rate_limits": { "max_weight": 20, "period_ms": 2000 },
        "headers": { "Accept": "application/json" },
        "broker": { "header": "x-broker-id", "id": "abc123" },
        "user_agent": "exchange-pipeline/0.1",
        "timeout_ms": 2500
    }"#;

    #[test]
    fn test_full_spec() {
        let exchange = Exchange::from_json(OKX, &CustomSigners::new()).unwrap();
        assert_eq!(exchange.id(), "okx");
        assert_eq!(
            exchange.signer().map(Signer::pattern),
            Some(SigningPattern::HmacSha256IsoPassphrase)
        );
        assert_eq!(exchange.rate_limit(), Some(&LimitConfig::new(20, 2_000)));
        assert_eq!(exchange.timeout(), Some(Duration::from_millis(2_500)));
        assert_eq!(exchange.static_headers()["x-broker-id"], "abc123");
        assert_eq!(exchange.static_headers()["user-agent"], "exchange-pipeline/0.1");
        assert_eq!(exchange.base_url(None, false).unwrap(), "https://www.okx.com");
        assert!(matches!(
            exchange.base_url(None, true),
            Err(ConfigError::MissingUrl { .. })
        ));
    }

    #[test]
    fn test_unknown_pattern_rejected_at_load() {
        let json = r#"{
            "id": "x",
            "urls": { "api": { "rest": "https://x.example" } },
            "signing": { "pattern": "hmac_sha1_legacy" }
        }"#;
        assert!(matches!(
            Exchange::from_json(json, &CustomSigners::new()),
            Err(ConfigError::UnknownPattern(_))
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        let bad_url = r#"{ "id": "x", "urls": { "api": { "rest": "not a url" } } }"#;
        assert!(matches!(
            Exchange::from_json(bad_url, &CustomSigners::new()),
            Err(ConfigError::Url(_))
        ));

        let bad_header = r#"{
            "id": "x",
            "urls": { "api": { "rest": "https://x.example" } },
            "headers": { "bad header": "v" }
        }"#;
        assert!(matches!(
            Exchange::from_json(bad_header, &CustomSigners::new()),
            Err(ConfigError::InvalidHeader(_))
        ));

        let non_ascii_value = r#"{
            "id": "x",
            "urls": { "api": { "rest": "https://x.example" } },
            "broker": { "header": "x-broker", "id": "café" }
        }"#;
        assert!(matches!(
            Exchange::from_json(non_ascii_value, &CustomSigners::new()),
            Err(ConfigError::InvalidHeader(name)) if name == "x-broker"
        ));

        let bad_limit = r#"{
            "id": "x",
            "urls": { "api": { "rest": "https://x.example" } },
            "rate_limits": { "requests": 0, "period": 1000 }
        }"#;
        assert!(matches!(
            Exchange::from_json(bad_limit, &CustomSigners::new()),
            Err(ConfigError::InvalidRateLimit(_))
        ));

        assert!(matches!(
            Exchange::from_json("{", &CustomSigners::new()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_url_resolution() {
        let mut urls = UrlTable::default();
        urls.api.insert("public".into(), "https://public.example".into());
        assert_eq!(urls.resolve(None, false), Some("https://public.example"));
        urls.api.insert("private".into(), "https://private.example".into());
        assert_eq!(urls.resolve(None, false), None);
        assert_eq!(urls.resolve(Some("private"), false), Some("https://private.example"));
        assert_eq!(urls.resolve(Some("private"), true), None);
    }
}
