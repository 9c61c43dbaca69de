//! Error types for the exchange pipeline.
//!
//! Every failure a caller can observe at request time is a [`NormalizedError`]
//! whose [`ErrorKind`] comes from one closed taxonomy, no matter whether the
//! problem was detected by the transport, the HTTP status, or an error encoded
//! in a successful response body. Configuration problems are reported earlier,
//! at load time, as [`ConfigError`].

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::signing::SigningError;

/// The normalized error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The exchange's circuit breaker is open; no request was sent.
    CircuitOpen,
    /// Transport failure: connection, TLS, timeout, or an unreadable body.
    NetworkError,
    /// The exchange throttled the request.
    RateLimited {
        /// Suggested wait time in milliseconds before retrying
        retry_after_ms: Option<u64>,
    },
    InvalidCredentials,
    InsufficientBalance,
    OrderNotFound,
    InvalidOrder,
    InvalidParameters,
    MarketClosed,
    /// An HTML page came back where an API response was expected
    /// (geo-blocking, WAF challenge, maintenance page).
    AccessRestricted {
        /// Contents of the page's `<title>`, if any
        title: Option<String>,
        /// A short, whitespace-collapsed prefix of the body
        body_preview: String,
        /// Likely causes, for display
        hints: Vec<String>,
    },
    /// The capability is absent or not implemented for this exchange.
    NotSupported,
    /// Generic exchange-side failure.
    ExchangeError,
}

impl ErrorKind {
    /// Stable snake_case name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::NetworkError => "network_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InsufficientBalance => "insufficient_balance",
            Self::OrderNotFound => "order_not_found",
            Self::InvalidOrder => "invalid_order",
            Self::InvalidParameters => "invalid_parameters",
            Self::MarketClosed => "market_closed",
            Self::AccessRestricted { .. } => "access_restricted",
            Self::NotSupported => "not_supported",
            Self::ExchangeError => "exchange_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A request-time failure, normalized across exchanges.
#[derive(Error, Debug, Clone)]
#[error("{exchange} {kind}: {message}")]
pub struct NormalizedError {
    /// What went wrong
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Exchange error code, when the exchange supplied one
    pub code: Option<String>,
    /// Exchange id
    pub exchange: String,
    /// The original payload, for debugging
    pub raw: Option<Value>,
}

impl NormalizedError {
    /// Create an error with no code and no raw payload.
    pub fn new(exchange: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            exchange: exchange.into(),
            raw: None,
        }
    }

    /// Attach the exchange error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the original payload.
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn circuit_open(exchange: impl Into<String>, retry_in_ms: Option<u64>) -> Self {
        let message = match retry_in_ms {
            Some(ms) => format!("circuit breaker open, next probe allowed in {ms}ms"),
            None => "circuit breaker open".to_string(),
        };
        Self::new(exchange, ErrorKind::CircuitOpen, message)
    }

    pub fn network(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::NetworkError, message)
    }

    /// Convert a signing failure into the taxonomy.
    pub fn from_signing(exchange: impl Into<String>, error: SigningError) -> Self {
        let kind = match &error {
            SigningError::MissingPassphrase { .. } | SigningError::InvalidSecret(_) => {
                ErrorKind::InvalidCredentials
            }
            SigningError::Unsupported(_) => ErrorKind::NotSupported,
            _ => ErrorKind::ExchangeError,
        };
        Self::new(exchange, kind, error.to_string())
    }

    /// Whether the error is a rate limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.kind, ErrorKind::RateLimited { .. })
    }

    /// The retry hint carried by a rate limit rejection.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self.kind {
            ErrorKind::RateLimited { retry_after_ms } => retry_after_ms,
            _ => None,
        }
    }
}

/// Errors raised while loading or validating exchange configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown signing pattern: {0}")]
    UnknownPattern(String),

    #[error("signing pattern {pattern} requires `{field}`")]
    MissingField {
        pattern: &'static str,
        field: &'static str,
    },

    #[error("custom signer {0:?} is not registered")]
    UnregisteredCustomSigner(String),

    #[error("custom signer {name:?} rejected: {reason}")]
    InvalidCustomSigner { name: String, reason: String },

    #[error("exchange {exchange} has no URL for {key:?}")]
    MissingUrl { exchange: String, key: String },

    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("invalid exchange spec: {0}")]
    InvalidSpec(String),

    #[error("request cost {cost} exceeds rate limit capacity {max_weight}")]
    CostExceedsCapacity { cost: u64, max_weight: u64 },

    #[error("environment variable {0} not set")]
    MissingEnv(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Error kinds an exchange's error-code table can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimited,
    InvalidCredentials,
    InsufficientBalance,
    OrderNotFound,
    InvalidOrder,
    InvalidParameters,
    MarketClosed,
    AccessRestricted,
    NotSupported,
    NetworkError,
    ExchangeError,
}

impl ErrorClass {
    /// Expand into a full [`ErrorKind`].
    pub fn into_kind(self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimited {
                retry_after_ms: None,
            },
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::InsufficientBalance => ErrorKind::InsufficientBalance,
            Self::OrderNotFound => ErrorKind::OrderNotFound,
            Self::InvalidOrder => ErrorKind::InvalidOrder,
            Self::InvalidParameters => ErrorKind::InvalidParameters,
            Self::MarketClosed => ErrorKind::MarketClosed,
            Self::AccessRestricted => ErrorKind::AccessRestricted {
                title: None,
                body_preview: String::new(),
                hints: Vec::new(),
            },
            Self::NotSupported => ErrorKind::NotSupported,
            Self::NetworkError => ErrorKind::NetworkError,
            Self::ExchangeError => ErrorKind::ExchangeError,
        }
    }
}

/// One row of an exchange's error-code table.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorCodeEntry {
    #[serde(rename = "type")]
    pub class: ErrorClass,
    #[serde(default)]
    pub description: Option<String>,
}

/// Exchange error code -> kind and human description.
///
/// ```rust
/// use exchange_pipeline::error::{ErrorCodeTable, ErrorKind};
///
/// let table: ErrorCodeTable = serde_json::from_str(
///     r#"{ "-2010": { "type": "insufficient_balance", "description": "Account has insufficient balance" } }"#,
/// ).unwrap();
/// let (kind, description) = table.lookup("-2010").unwrap();
/// assert_eq!(kind, ErrorKind::InsufficientBalance);
/// assert_eq!(description, Some("Account has insufficient balance"));
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ErrorCodeTable(HashMap<String, ErrorCodeEntry>);

impl ErrorCodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn insert(
        &mut self,
        code: impl Into<String>,
        class: ErrorClass,
        description: Option<&str>,
    ) -> &mut Self {
        self.0.insert(
            code.into(),
            ErrorCodeEntry {
                class,
                description: description.map(str::to_string),
            },
        );
        self
    }

    /// Look up a code.
    pub fn lookup(&self, code: &str) -> Option<(ErrorKind, Option<&str>)> {
        self.0
            .get(code)
            .map(|entry| (entry.class.into_kind(), entry.description.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Guess a kind from message text when the code is not in the table.
///
/// The phrases cover the wording most exchanges use for the same conditions.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "too many requests", "too many visits", "request limit"]) {
        Some(ErrorKind::RateLimited {
            retry_after_ms: None,
        })
    } else if has(&["insufficient", "not enough balance", "balance not enough"]) {
        Some(ErrorKind::InsufficientBalance)
    } else if has(&["order not found", "unknown order", "order does not exist", "order not exist"]) {
        Some(ErrorKind::OrderNotFound)
    } else if has(&[
        "invalid signature",
        "invalid key",
        "invalid api",
        "api key",
        "apikey",
        "permission denied",
        "unauthorized",
        "invalid nonce",
    ]) {
        Some(ErrorKind::InvalidCredentials)
    } else if has(&["market closed", "market is closed", "trading halted", "cancel_only", "post_only mode"]) {
        Some(ErrorKind::MarketClosed)
    } else if has(&["invalid order", "order rejected", "min notional", "lot size"]) {
        Some(ErrorKind::InvalidOrder)
    } else if has(&["invalid parameter", "invalid argument", "missing parameter", "mandatory parameter"]) {
        Some(ErrorKind::InvalidParameters)
    } else {
        None
    }
}
