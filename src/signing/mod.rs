//! The signing engine.
//!
//! A [`SigningConfig`] from an exchange spec is resolved once, at load time,
//! into a concrete [`Signer`]. Unknown pattern names and unregistered custom
//! signers fail there, never on the request path.
//!
//! Signing is a pure transform: apart from reading the clock and consuming a
//! nonce it has no side effects, and it never validates credentials. Empty
//! keys and secrets produce a well-formed signature the exchange will reject.
//!
//! ```rust
//! use std::sync::Arc;
//! use exchange_pipeline::auth::{Credentials, FixedNonce};
//! use exchange_pipeline::clock::ManualClock;
//! use exchange_pipeline::signing::{
//!     CustomSigners, Request, SignContext, SignOutcome, Signer, SigningConfig, SigningPattern,
//! };
//!
//! let signer = Signer::from_config(
//!     &SigningConfig::for_pattern(SigningPattern::HmacSha256Query),
//!     &CustomSigners::new(),
//! ).unwrap();
//! let ctx = SignContext::new("https://api.binance.com")
//!     .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
//!     .with_nonce(Arc::new(FixedNonce(1)));
//! let request = Request::get("/api/v3/account").param("symbol", "BTCUSDT");
//! let creds = Credentials::new("key", "secret");
//!
//! match signer.sign(&request, &creds, &ctx).unwrap() {
//!     SignOutcome::Http(signed) => assert!(signed.url.contains("signature=")),
//!     _ => unreachable!(),
//! }
//! ```

mod config;
pub mod encode;
mod gate;
mod hmac_headers;
mod hmac_query;
mod iso_passphrase;
mod nonce_body;
mod payload_sha384;
mod deribit;
mod websocket;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

use crate::auth::{Credentials, IncreasingNonce, NonceProvider};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;

pub use config::{
    HeaderPair, InlineMode, NoncePayload, PayloadVariant, SigningConfig, SigningPattern,
    TimestampUnit,
};
pub use deribit::DeribitSigner;
pub use gate::GateSigner;
pub use hmac_headers::HmacHeaders;
pub use hmac_query::HmacQuery;
pub use iso_passphrase::{IsoPassphrase, KucoinSigner};
pub use nonce_body::NonceBody;
pub use payload_sha384::Sha384Payload;
pub use websocket::{
    ExternalCall, TwoPhase, TwoPhaseKind, WsAuth, WsDirectExpiry, WsInlineSubscribe,
    WsIsoPassphrase, WsJsonRpc,
};

/// Errors produced while signing a request.
#[derive(Error, Debug)]
pub enum SigningError {
    /// The pattern needs a passphrase and none was configured.
    #[error("{pattern} requires a passphrase")]
    MissingPassphrase { pattern: &'static str },

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("failed to encode parameters: {0}")]
    Encoding(#[from] serde_urlencoded::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timestamp error: {0}")]
    Timestamp(String),

    /// The pattern cannot produce the requested kind of output.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("custom signer failed: {0}")]
    Custom(String),
}

/// A logical, unsigned request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: BTreeMap<String, Value>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replace all parameters.
    pub fn params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Set an explicit body, overriding the params-as-body convention.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A request ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SignedRequest {
    /// First header value with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add a header unless one with the same name is already present.
    pub fn set_default_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if self.header(&name).is_none() {
            self.headers.push((name, value.into()));
        }
    }

    /// The query string portion of the URL, if any.
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }
}

/// Result of running a signer.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    /// A signed HTTP request.
    Http(SignedRequest),
    /// WebSocket authentication material.
    WebSocket(WsAuth),
    /// A two-phase pattern: the caller must perform this REST call first and
    /// feed the resulting token back in.
    NeedsExternalCall(ExternalCall),
}

impl SignOutcome {
    pub fn into_http(self) -> Option<SignedRequest> {
        match self {
            Self::Http(request) => Some(request),
            _ => None,
        }
    }

    pub fn into_ws(self) -> Option<WsAuth> {
        match self {
            Self::WebSocket(auth) => Some(auth),
            _ => None,
        }
    }
}

/// Everything a signer reads besides the request and credentials.
#[derive(Clone)]
pub struct SignContext {
    /// Resolved base URL of the exchange
    pub base_url: String,
    pub clock: Arc<dyn Clock>,
    pub nonce: Arc<dyn NonceProvider>,
}

impl SignContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            clock: Arc::new(SystemClock),
            nonce: Arc::new(IncreasingNonce::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_nonce(mut self, nonce: Arc<dyn NonceProvider>) -> Self {
        self.nonce = nonce;
        self
    }
}

impl std::fmt::Debug for SignContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignContext")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// A user-supplied signing implementation for exchanges none of the built-in
/// patterns cover.
pub trait RequestSigner: Send + Sync {
    /// Sign `request`. Same contract as the built-in patterns.
    fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignOutcome, SigningError>;

    /// Checked once at registration. Return `Err` with a reason if the
    /// implementation is not usable (missing key material, wrong mode...).
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Registry of custom signers, consulted when a spec uses `"pattern": "custom"`.
#[derive(Clone, Default)]
pub struct CustomSigners {
    signers: HashMap<String, Arc<dyn RequestSigner>>,
}

impl CustomSigners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signer` under `name`, validating it first.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidCustomSigner {
                name,
                reason: "name must not be empty".into(),
            });
        }
        if self.signers.contains_key(&name) {
            return Err(ConfigError::InvalidCustomSigner {
                name,
                reason: "already registered".into(),
            });
        }
        signer
            .validate()
            .map_err(|reason| ConfigError::InvalidCustomSigner {
                name: name.clone(),
                reason,
            })?;
        self.signers.insert(name, signer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RequestSigner>> {
        self.signers.get(name).cloned()
    }
}

impl std::fmt::Debug for CustomSigners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomSigners")
            .field("names", &self.signers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A resolved signing strategy.
#[derive(Clone)]
pub enum Signer {
    HmacHeaders(HmacHeaders),
    HmacQuery(HmacQuery),
    IsoPassphrase(IsoPassphrase),
    Kucoin(KucoinSigner),
    NonceBody(NonceBody),
    Gate(GateSigner),
    Sha384Payload(Sha384Payload),
    Deribit(DeribitSigner),
    WsDirectExpiry(WsDirectExpiry),
    WsInlineSubscribe(WsInlineSubscribe),
    WsIsoPassphrase(WsIsoPassphrase),
    WsJsonRpc(WsJsonRpc),
    TwoPhase(TwoPhase),
    Custom {
        name: String,
        signer: Arc<dyn RequestSigner>,
    },
}

impl Signer {
    /// Resolve a config into a strategy.
    pub fn from_config(config: &SigningConfig, custom: &CustomSigners) -> Result<Self, ConfigError> {
        let signer = match config.pattern()? {
            SigningPattern::HmacSha256Headers => Self::HmacHeaders(HmacHeaders::from_config(config)),
            SigningPattern::HmacSha256Query => Self::HmacQuery(HmacQuery::from_config(config)),
            SigningPattern::HmacSha256IsoPassphrase => {
                Self::IsoPassphrase(IsoPassphrase::from_config(config))
            }
            SigningPattern::HmacSha256Kucoin => Self::Kucoin(KucoinSigner::from_config(config)),
            SigningPattern::HmacSha512Nonce => Self::NonceBody(NonceBody::from_config(config)),
            SigningPattern::HmacSha512Gate => Self::Gate(GateSigner::from_config(config)),
            SigningPattern::HmacSha384Payload => {
                Self::Sha384Payload(Sha384Payload::from_config(config))
            }
            SigningPattern::Deribit => Self::Deribit(DeribitSigner),
            SigningPattern::WsDirectHmacExpiry => {
                Self::WsDirectExpiry(WsDirectExpiry::from_config(config))
            }
            SigningPattern::WsInlineSubscribe => {
                Self::WsInlineSubscribe(WsInlineSubscribe::from_config(config))
            }
            SigningPattern::WsIsoPassphrase => {
                Self::WsIsoPassphrase(WsIsoPassphrase::from_config(config))
            }
            SigningPattern::WsJsonRpcLinebreak => Self::WsJsonRpc(WsJsonRpc::from_config(config)),
            SigningPattern::WsListenKey => {
                Self::TwoPhase(TwoPhase::from_config(TwoPhaseKind::ListenKey, config)?)
            }
            SigningPattern::WsRestToken => {
                Self::TwoPhase(TwoPhase::from_config(TwoPhaseKind::RestToken, config)?)
            }
            SigningPattern::Custom => {
                let name = config.custom_signer.clone().ok_or(ConfigError::MissingField {
                    pattern: "custom",
                    field: "custom_signer",
                })?;
                let signer = custom
                    .get(&name)
                    .ok_or_else(|| ConfigError::UnregisteredCustomSigner(name.clone()))?;
                Self::Custom { name, signer }
            }
        };
        Ok(signer)
    }

    /// The pattern this strategy implements.
    pub fn pattern(&self) -> SigningPattern {
        match self {
            Self::HmacHeaders(_) => SigningPattern::HmacSha256Headers,
            Self::HmacQuery(_) => SigningPattern::HmacSha256Query,
            Self::IsoPassphrase(_) => SigningPattern::HmacSha256IsoPassphrase,
            Self::Kucoin(_) => SigningPattern::HmacSha256Kucoin,
            Self::NonceBody(_) => SigningPattern::HmacSha512Nonce,
            Self::Gate(_) => SigningPattern::HmacSha512Gate,
            Self::Sha384Payload(_) => SigningPattern::HmacSha384Payload,
            Self::Deribit(_) => SigningPattern::Deribit,
            Self::WsDirectExpiry(_) => SigningPattern::WsDirectHmacExpiry,
            Self::WsInlineSubscribe(_) => SigningPattern::WsInlineSubscribe,
            Self::WsIsoPassphrase(_) => SigningPattern::WsIsoPassphrase,
            Self::WsJsonRpc(_) => SigningPattern::WsJsonRpcLinebreak,
            Self::TwoPhase(t) => match t.kind {
                TwoPhaseKind::ListenKey => SigningPattern::WsListenKey,
                TwoPhaseKind::RestToken => SigningPattern::WsRestToken,
            },
            Self::Custom { .. } => SigningPattern::Custom,
        }
    }

    /// Sign a request.
    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignOutcome, SigningError> {
        match self {
            Self::HmacHeaders(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::HmacQuery(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::IsoPassphrase(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::Kucoin(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::NonceBody(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::Gate(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::Sha384Payload(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::Deribit(s) => s.sign(request, credentials, ctx).map(SignOutcome::Http),
            Self::WsDirectExpiry(s) => s.sign(credentials, ctx).map(SignOutcome::WebSocket),
            Self::WsInlineSubscribe(s) => {
                s.sign(request, credentials, ctx).map(SignOutcome::WebSocket)
            }
            Self::WsIsoPassphrase(s) => s.sign(credentials, ctx).map(SignOutcome::WebSocket),
            Self::WsJsonRpc(s) => s.sign(credentials, ctx).map(SignOutcome::WebSocket),
            Self::TwoPhase(s) => Ok(SignOutcome::NeedsExternalCall(s.external_call())),
            Self::Custom { signer, .. } => signer.sign(request, credentials, ctx),
        }
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom { name, .. } => f.debug_struct("Signer::Custom").field("name", name).finish(),
            other => f
                .debug_tuple("Signer")
                .field(&other.pattern().as_str())
                .finish(),
        }
    }
}
