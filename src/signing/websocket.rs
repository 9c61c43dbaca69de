//! WebSocket authentication patterns.
//!
//! These produce auth material for a socket rather than an HTTP request:
//! either a standalone message to send after connecting, or fields to merge
//! into a subscribe message. The two-phase patterns (listen key, REST token)
//! sign nothing; they describe the REST call the caller has to make first.

use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::error::ConfigError;
use crate::signing::config::{InlineMode, SigningConfig, TimestampUnit, header_or};
use crate::signing::encode::param_string;
use crate::signing::{Request, SignContext, SigningError};

/// WebSocket auth output.
#[derive(Debug, Clone, PartialEq)]
pub enum WsAuth {
    /// A message to send as-is once the socket is open.
    Message(Value),
    /// Fields to merge into each subscribe message.
    InlineFields(Map<String, Value>),
}

impl WsAuth {
    /// Render as a text frame. Inline fields are sent as a bare object.
    pub fn to_frame(&self) -> Result<Message, SigningError> {
        let text = match self {
            Self::Message(value) => serde_json::to_string(value)?,
            Self::InlineFields(fields) => serde_json::to_string(fields)?,
        };
        Ok(Message::text(text))
    }

    /// Merge inline fields into `message`. A standalone auth message is left out.
    pub fn merge_into(&self, message: &mut Value) {
        if let (Self::InlineFields(fields), Value::Object(target)) = (self, message) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// `GET/realtime{expires}` signed into an `{"op": "auth"}` message (Bybit, BitMEX).
#[derive(Debug, Clone)]
pub struct WsDirectExpiry {
    expires_after_ms: u64,
    digest: Digest,
    encoding: Encoding,
}

impl WsDirectExpiry {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            expires_after_ms: config.expires_after_ms.unwrap_or(10_000),
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Hex),
        }
    }

    pub fn sign(&self, credentials: &Credentials, ctx: &SignContext) -> Result<WsAuth, SigningError> {
        let expires = ctx.clock.now_ms().saturating_add(self.expires_after_ms);
        let signature = sign(
            self.digest,
            self.encoding,
            credentials.expose_secret(),
            &format!("GET/realtime{expires}"),
        )?;
        Ok(WsAuth::Message(json!({
            "op": "auth",
            "args": [credentials.api_key, expires, signature],
        })))
    }
}

/// Signature fields carried inside every subscribe message.
#[derive(Debug, Clone)]
pub struct WsInlineSubscribe {
    mode: InlineMode,
    key_field: String,
    signature_field: String,
    timestamp_field: String,
    passphrase_field: String,
    timestamp_unit: TimestampUnit,
    digest: Digest,
    encoding: Encoding,
}

impl WsInlineSubscribe {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            mode: config.inline_mode.unwrap_or_default(),
            key_field: header_or(&config.api_key_header, "key"),
            signature_field: header_or(&config.signature_header, "signature"),
            timestamp_field: header_or(&config.timestamp_header, "timestamp"),
            passphrase_field: header_or(&config.passphrase_header, "passphrase"),
            timestamp_unit: config.timestamp_unit.unwrap_or_default(),
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Hex),
        }
    }

    /// `request.path` is the signed path in request mode and the channel name
    /// in channel mode; channel mode reads symbols from the `symbols` param.
    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<WsAuth, SigningError> {
        let timestamp = self.timestamp_unit.from_ms(ctx.clock.now_ms()).to_string();
        let payload = match self.mode {
            InlineMode::Request => {
                format!("{timestamp}{}{}", request.method.as_str(), request.path)
            }
            InlineMode::Channel => {
                let symbols = match request.params.get("symbols") {
                    Some(Value::Array(items)) => {
                        items.iter().map(param_string).collect::<Vec<_>>().join(",")
                    }
                    Some(other) => param_string(other),
                    None => String::new(),
                };
                format!("{timestamp}{}{symbols}", request.path)
            }
        };
        let signature = sign(self.digest, self.encoding, credentials.expose_secret(), &payload)?;

        let mut fields = Map::new();
        fields.insert(self.key_field.clone(), credentials.api_key.clone().into());
        fields.insert(self.signature_field.clone(), signature.into());
        fields.insert(self.timestamp_field.clone(), timestamp.into());
        if let Some(passphrase) = credentials.expose_password() {
            fields.insert(self.passphrase_field.clone(), passphrase.into());
        }
        Ok(WsAuth::InlineFields(fields))
    }
}

/// OKX-style login message. Unlike the REST pattern, a missing passphrase is
/// an error.
#[derive(Debug, Clone)]
pub struct WsIsoPassphrase {
    digest: Digest,
    encoding: Encoding,
}

impl WsIsoPassphrase {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Base64),
        }
    }

    pub fn sign(&self, credentials: &Credentials, ctx: &SignContext) -> Result<WsAuth, SigningError> {
        let passphrase = credentials
            .expose_password()
            .ok_or(SigningError::MissingPassphrase {
                pattern: "ws_iso_passphrase",
            })?;
        let timestamp = (ctx.clock.now_ms() / 1_000).to_string();
        let signature = sign(
            self.digest,
            self.encoding,
            credentials.expose_secret(),
            &format!("{timestamp}GET/users/self/verify"),
        )?;
        Ok(WsAuth::Message(json!({
            "op": "login",
            "args": [{
                "apiKey": credentials.api_key,
                "passphrase": passphrase,
                "timestamp": timestamp,
                "sign": signature,
            }],
        })))
    }
}

/// Deribit's JSON-RPC `public/auth` with a client signature over
/// `timestamp \n nonce \n data`.
#[derive(Debug, Clone)]
pub struct WsJsonRpc {
    method: String,
}

impl WsJsonRpc {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            method: header_or(&config.method, "public/auth"),
        }
    }

    pub fn sign(&self, credentials: &Credentials, ctx: &SignContext) -> Result<WsAuth, SigningError> {
        let timestamp = ctx.clock.now_ms();
        let nonce = ctx.nonce.next_nonce().to_string();
        let signature = sign(
            Digest::Sha256,
            Encoding::Hex,
            credentials.expose_secret(),
            &format!("{timestamp}\n{nonce}\n"),
        )?;
        Ok(WsAuth::Message(json!({
            "jsonrpc": "2.0",
            "id": timestamp,
            "method": self.method,
            "params": {
                "grant_type": "client_signature",
                "client_id": credentials.api_key,
                "timestamp": timestamp,
                "signature": signature,
                "nonce": nonce,
                "data": "",
            },
        })))
    }
}

/// Which kind of token a two-phase pattern fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoPhaseKind {
    /// A listen key embedded in the socket URL.
    ListenKey,
    /// A token sent inside subscribe messages.
    RestToken,
}

/// The REST call a caller must make before a two-phase socket can authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCall {
    pub kind: TwoPhaseKind,
    pub endpoint: String,
    pub method: Method,
    /// Refresh the token at least this often
    pub refresh_interval_ms: u64,
}

/// Listen-key and REST-token patterns.
#[derive(Debug, Clone)]
pub struct TwoPhase {
    pub kind: TwoPhaseKind,
    endpoint: String,
    method: Method,
    refresh_interval_ms: u64,
}

impl TwoPhase {
    pub(crate) fn from_config(kind: TwoPhaseKind, config: &SigningConfig) -> Result<Self, ConfigError> {
        let endpoint = match (kind, &config.endpoint) {
            (_, Some(endpoint)) => endpoint.clone(),
            (TwoPhaseKind::ListenKey, None) => "/api/v3/userDataStream".to_string(),
            (TwoPhaseKind::RestToken, None) => {
                return Err(ConfigError::MissingField {
                    pattern: "ws_rest_token",
                    field: "endpoint",
                });
            }
        };
        let method = match &config.method {
            Some(name) => Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                .map_err(|_| ConfigError::InvalidMethod(name.clone()))?,
            None => Method::POST,
        };
        let refresh_interval_ms = config.refresh_interval_ms.unwrap_or(match kind {
            TwoPhaseKind::ListenKey => 30 * 60 * 1_000,
            TwoPhaseKind::RestToken => 10 * 60 * 1_000,
        });
        Ok(Self {
            kind,
            endpoint,
            method,
            refresh_interval_ms,
        })
    }

    pub fn external_call(&self) -> ExternalCall {
        ExternalCall {
            kind: self.kind,
            endpoint: self.endpoint.clone(),
            method: self.method.clone(),
            refresh_interval_ms: self.refresh_interval_ms,
        }
    }

    /// Pull the token out of the REST response.
    pub fn extract_token(&self, body: &Value) -> Option<String> {
        let candidates: &[&str] = match self.kind {
            TwoPhaseKind::ListenKey => &["/listenKey", "/result/listenKey", "/data/listenKey"],
            TwoPhaseKind::RestToken => &["/token", "/result/token", "/data/token"],
        };
        candidates
            .iter()
            .find_map(|pointer| body.pointer(pointer))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Socket URL with a listen key appended as the last path segment.
    pub fn ws_url(base_ws_url: &str, listen_key: &str) -> String {
        format!("{}/{listen_key}", base_ws_url.trim_end_matches('/'))
    }

    /// Inline fields carrying a REST token.
    pub fn subscribe_fields(token: &str) -> WsAuth {
        let mut fields = Map::new();
        fields.insert("token".to_string(), Value::String(token.to_string()));
        WsAuth::InlineFields(fields)
    }
}
