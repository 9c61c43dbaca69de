use crate::auth::{Credentials, Digest, Encoding, sha512_hex, sign};
use crate::signing::config::{SigningConfig, header_or};
use crate::signing::encode::{RequestParts, join_url};
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

/// Gate.io v4 signing.
///
/// ```text
/// METHOD \n prefix+path \n query \n hex(SHA512(body)) \n timestamp_secs
/// ```
#[derive(Debug, Clone)]
pub struct GateSigner {
    api_key_header: String,
    signature_header: String,
    timestamp_header: String,
    signing_path_prefix: String,
}

impl GateSigner {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            api_key_header: header_or(&config.api_key_header, "KEY"),
            signature_header: header_or(&config.signature_header, "SIGN"),
            timestamp_header: header_or(&config.timestamp_header, "Timestamp"),
            signing_path_prefix: header_or(&config.signing_path_prefix, "/api/v4"),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = (ctx.clock.now_ms() / 1_000).to_string();
        let parts = RequestParts::json(request)?;
        let payload = format!(
            "{}\n{}{}\n{}\n{}\n{timestamp}",
            request.method.as_str(),
            self.signing_path_prefix,
            request.path,
            parts.query,
            sha512_hex(parts.body_str().as_bytes()),
        );
        let signature = sign(
            Digest::Sha512,
            Encoding::Hex,
            credentials.expose_secret(),
            &payload,
        )?;

        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (self.api_key_header.clone(), credentials.api_key.clone()),
            (self.signature_header.clone(), signature),
            (self.timestamp_header.clone(), timestamp),
        ];

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &parts.query),
            method: request.method.clone(),
            headers,
            body: parts.body,
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
        SignContext::new("https://api.gateio.ws/api/v4")
            .with_clock(Arc::new(ManualClock::new(1_700_000_000_123)))
            .with_nonce(Arc::new(FixedNonce(1)))
    }

    #[test]
    fn test_payload_layout() {
        let signer = GateSigner::from_config(&SigningConfig::for_pattern(SigningPattern::HmacSha512Gate));
        let request = Request::get("/spot/orders").param("currency_pair", "BTC_USDT");
        let signed = signer
            .sign(&request, &Credentials::new("key", "secret"), &ctx())
            .unwrap();

        let payload = format!(
            "GET\n/api/v4/spot/orders\ncurrency_pair=BTC_USDT\n{}\n1700000000",
            sha512_hex(b"")
        );
        let expected = sign(Digest::Sha512, Encoding::Hex, "secret", &payload).unwrap();
        assert_eq!(signed.header("SIGN"), Some(expected.as_str()));
        assert_eq!(signed.header("Timestamp"), Some("1700000000"));
        assert_eq!(signed.header("SIGN").map(str::len), Some(128));
        assert_eq!(
            signed.url,
            "https://api.gateio.ws/api/v4/spot/orders?currency_pair=BTC_USDT"
        );
    }

    #[test]
    fn test_signing_path_prefix_changes_signature() {
        let default = GateSigner::from_config(&SigningConfig::for_pattern(SigningPattern::HmacSha512Gate));
        let mut config = SigningConfig::for_pattern(SigningPattern::HmacSha512Gate);
        config.signing_path_prefix = Some("/api/v3".into());
        let other = GateSigner::from_config(&config);

        let request = Request::post("/spot/orders").param("amount", "1");
        let creds = Credentials::new("key", "secret");
        let a = default.sign(&request, &creds, &ctx()).unwrap();
        let b = other.sign(&request, &creds, &ctx()).unwrap();
        assert_ne!(a.header("SIGN"), b.header("SIGN"));
        assert_eq!(a.body, b.body);
    }
}
