//! Base64 JSON payload signed with HMAC-SHA384 (Bitfinex v1 and Gemini).
//!
//! The payload is `{"request": path, "nonce": "<n>", ...params}`. Both
//! variants send it base64-encoded in a header and sign that base64 string.
//! Bitfinex also sends the JSON as the request body; Gemini sends no body.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value};

use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::signing::config::{PayloadVariant, SigningConfig, header_or};
use crate::signing::encode::join_url;
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

#[derive(Debug, Clone)]
pub struct Sha384Payload {
    variant: PayloadVariant,
    api_key_header: String,
    payload_header: String,
    signature_header: String,
}

impl Sha384Payload {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        let variant = config.variant.unwrap_or(PayloadVariant::Bitfinex);
        let prefix = match variant {
            PayloadVariant::Bitfinex => "X-BFX",
            PayloadVariant::Gemini => "X-GEMINI",
        };
        Self {
            variant,
            api_key_header: header_or(&config.api_key_header, &format!("{prefix}-APIKEY")),
            payload_header: header_or(&config.payload_header, &format!("{prefix}-PAYLOAD")),
            signature_header: header_or(&config.signature_header, &format!("{prefix}-SIGNATURE")),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let mut payload = Map::new();
        for (key, value) in &request.params {
            payload.insert(key.clone(), value.clone());
        }
        if let Some(Value::Object(extra)) = &request.body {
            for (key, value) in extra {
                payload.insert(key.clone(), value.clone());
            }
        }
        payload.insert("request".to_string(), Value::String(request.path.clone()));
        payload.insert(
            "nonce".to_string(),
            Value::String(ctx.nonce.next_nonce().to_string()),
        );

        let json = serde_json::to_string(&payload)?;
        let encoded = BASE64.encode(&json);
        let signature = sign(
            Digest::Sha384,
            Encoding::Hex,
            credentials.expose_secret(),
            &encoded,
        )?;

        let (content_type, body) = match self.variant {
            PayloadVariant::Bitfinex => ("application/json", Some(json)),
            PayloadVariant::Gemini => ("text/plain", None),
        };
        let headers = vec![
            ("Content-Type".to_string(), content_type.to_string()),
            (self.api_key_header.clone(), credentials.api_key.clone()),
            (self.payload_header.clone(), encoded),
            (self.signature_header.clone(), signature),
        ];

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, ""),
            method: request.method.clone(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::FixedNonce;
    use crate::clock::ManualClock;
    use crate::signing::SigningPattern;

    fn ctx() -> SignContext {
        SignContext::new("https://api.gemini.com")
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_nonce(Arc::new(FixedNonce(99)))
    }

    fn signer(variant: PayloadVariant) -> Sha384Payload {
        let mut config = SigningConfig::for_pattern(SigningPattern::HmacSha384Payload);
        config.variant = Some(variant);
        Sha384Payload::from_config(&config)
    }

    #[test]
    fn test_gemini_sends_payload_header_and_no_body() {
        let request = Request::post("/v1/order/status").param("order_id", 7);
        let signed = signer(PayloadVariant::Gemini)
            .sign(&request, &Credentials::new("key", "secret"), &ctx())
            .unwrap();

        assert!(signed.body.is_none());
        let payload = signed.header("X-GEMINI-PAYLOAD").unwrap();
        let decoded: Value = serde_json::from_slice(&BASE64.decode(payload).unwrap()).unwrap();
        assert_eq!(decoded["request"], "/v1/order/status");
        assert_eq!(decoded["nonce"], "99");
        assert_eq!(decoded["order_id"], 7);

        let expected = sign(Digest::Sha384, Encoding::Hex, "secret", payload).unwrap();
        assert_eq!(signed.header("X-GEMINI-SIGNATURE"), Some(expected.as_str()));
        assert_eq!(expected.len(), 96);
    }

    #[test]
    fn test_bitfinex_sends_json_body() {
        let signed = signer(PayloadVariant::Bitfinex)
            .sign(
                &Request::post("/v1/balances"),
                &Credentials::new("key", "secret"),
                &ctx(),
            )
            .unwrap();
        let body = signed.body.as_deref().unwrap();
        assert_eq!(
            signed.header("X-BFX-PAYLOAD"),
            Some(BASE64.encode(body).as_str())
        );
        assert!(signed.header("X-BFX-SIGNATURE").is_some());
        assert_eq!(signed.header("X-BFX-APIKEY"), Some("key"));
    }
}
