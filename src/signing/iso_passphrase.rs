//! Passphrase-carrying header patterns (OKX and KuCoin families).
//!
//! Both sign an empty passphrase when none is configured and let the exchange
//! reject the request; they never fail locally on a missing passphrase.

use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::signing::config::{HeaderPair, SigningConfig, header_or};
use crate::signing::encode::{RequestParts, iso8601_ms, join_url, path_with_query};
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

fn prehash(timestamp: &str, request: &Request, parts: &RequestParts) -> String {
    format!(
        "{timestamp}{}{}{}",
        request.method.as_str(),
        path_with_query(&request.path, &parts.query),
        parts.body_str()
    )
}

/// `ISO8601_ms + METHOD + path(?query) + body`, base64 HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct IsoPassphrase {
    api_key_header: String,
    signature_header: String,
    timestamp_header: String,
    passphrase_header: String,
    sandbox_header: Option<HeaderPair>,
    digest: Digest,
    encoding: Encoding,
}

impl IsoPassphrase {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            api_key_header: header_or(&config.api_key_header, "OK-ACCESS-KEY"),
            signature_header: header_or(&config.signature_header, "OK-ACCESS-SIGN"),
            timestamp_header: header_or(&config.timestamp_header, "OK-ACCESS-TIMESTAMP"),
            passphrase_header: header_or(&config.passphrase_header, "OK-ACCESS-PASSPHRASE"),
            sandbox_header: config.sandbox_header.clone(),
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Base64),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = iso8601_ms(ctx.clock.now_ms())?;
        let parts = RequestParts::json(request)?;
        let payload = prehash(&timestamp, request, &parts);
        let signature = sign(self.digest, self.encoding, credentials.expose_secret(), &payload)?;

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (self.api_key_header.clone(), credentials.api_key.clone()),
            (self.signature_header.clone(), signature),
            (self.timestamp_header.clone(), timestamp),
            (
                self.passphrase_header.clone(),
                credentials.expose_password().unwrap_or_default().to_string(),
            ),
        ];
        if credentials.sandbox {
            if let Some(pair) = &self.sandbox_header {
                headers.push((pair.name.clone(), pair.value.clone()));
            }
        }

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &parts.query),
            method: request.method.clone(),
            headers,
            body: parts.body,
        })
    }
}

/// KuCoin: millisecond timestamp, and a passphrase that is itself
/// HMAC-signed for version 2 keys.
#[derive(Debug, Clone)]
pub struct KucoinSigner {
    api_key_header: String,
    signature_header: String,
    timestamp_header: String,
    passphrase_header: String,
}

impl KucoinSigner {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            api_key_header: header_or(&config.api_key_header, "KC-API-KEY"),
            signature_header: header_or(&config.signature_header, "KC-API-SIGN"),
            timestamp_header: header_or(&config.timestamp_header, "KC-API-TIMESTAMP"),
            passphrase_header: header_or(&config.passphrase_header, "KC-API-PASSPHRASE"),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = ctx.clock.now_ms().to_string();
        let parts = RequestParts::json(request)?;
        let secret = credentials.expose_secret();
        let signature = sign(
            Digest::Sha256,
            Encoding::Base64,
            secret,
            &prehash(&timestamp, request, &parts),
        )?;

        let raw_passphrase = credentials.expose_password().unwrap_or_default();
        let passphrase = if credentials.key_version >= 2 {
            sign(Digest::Sha256, Encoding::Base64, secret, raw_passphrase)?
        } else {
            raw_passphrase.to_string()
        };

        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (self.api_key_header.clone(), credentials.api_key.clone()),
            (self.signature_header.clone(), signature),
            (self.timestamp_header.clone(), timestamp),
            (self.passphrase_header.clone(), passphrase),
            (
                "KC-API-KEY-VERSION".to_string(),
                credentials.key_version.to_string(),
            ),
        ];

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &parts.query),
            method: request.method.clone(),
            headers,
            body: parts.body,
        })
    }
}
