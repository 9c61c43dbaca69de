use std::collections::BTreeMap;

use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::signing::config::{SigningConfig, header_or};
use crate::signing::encode::{join_url, param_pairs, query_string};
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

/// Binance-style signing: the sorted query string, timestamp included, is
/// signed and the signature appended as the last parameter.
#[derive(Debug, Clone)]
pub struct HmacQuery {
    api_key_header: String,
    signature_param: String,
    timestamp_param: String,
    recv_window: Option<u64>,
    digest: Digest,
    encoding: Encoding,
}

impl HmacQuery {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            api_key_header: header_or(&config.api_key_header, "X-MBX-APIKEY"),
            signature_param: header_or(&config.signature_param, "signature"),
            timestamp_param: header_or(&config.timestamp_param, "timestamp"),
            recv_window: config.recv_window,
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Hex),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let mut params: BTreeMap<String, serde_json::Value> = request.params.clone();
        params.insert(self.timestamp_param.clone(), ctx.clock.now_ms().into());
        if let Some(window) = self.recv_window {
            params.insert("recvWindow".to_string(), window.into());
        }

        let query = query_string(&param_pairs(&params))?;
        let signature = sign(self.digest, self.encoding, credentials.expose_secret(), &query)?;
        let signed_query = format!("{query}&{}={signature}", self.signature_param);

        let body = request.body.as_ref().map(serde_json::to_string).transpose()?;
        let mut headers = vec![(self.api_key_header.clone(), credentials.api_key.clone())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &signed_query),
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
        SignContext::new("https://api.binance.com")
            .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
            .with_nonce(Arc::new(FixedNonce(1)))
    }

    fn signer(config: SigningConfig) -> HmacQuery {
        HmacQuery::from_config(&config)
    }

    #[test]
    fn test_symbol_query_is_sorted_and_signed() {
        let signer = signer(SigningConfig::for_pattern(SigningPattern::HmacSha256Query));
        let request = Request::get("/api/v3/account").param("symbol", "BTCUSDT");
        let signed = signer
            .sign(&request, &Credentials::new("key", "secret"), &ctx())
            .unwrap();

        let query = signed.query().unwrap();
        let (unsigned, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(unsigned, "symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(
            signature,
            sign(Digest::Sha256, Encoding::Hex, "secret", unsigned).unwrap()
        );
        assert_eq!(signed.header("X-MBX-APIKEY"), Some("key"));
    }

    #[test]
    fn test_recv_window_included_in_signed_params() {
        let mut config = SigningConfig::for_pattern(SigningPattern::HmacSha256Query);
        config.recv_window = Some(5000);
        let signed = signer(config)
            .sign(
                &Request::post("/api/v3/order")
                    .param("side", "BUY")
                    .param("quantity", "0.1"),
                &Credentials::new("k", "s"),
                &ctx(),
            )
            .unwrap();

        let (unsigned, _) = signed.query().unwrap().rsplit_once("&signature=").unwrap();
        assert_eq!(
            unsigned,
            "quantity=0.1&recvWindow=5000&side=BUY&timestamp=1700000000000"
        );
        assert!(signed.body.is_none());
    }

    #[test]
    fn test_real_clock_signatures_differ() {
        let signer = signer(SigningConfig::for_pattern(SigningPattern::HmacSha256Query));
        let creds = Credentials::new("k", "s");
        let request = Request::get("/x");
        let a = signer
            .sign(&request, &creds, &SignContext::new("https://h"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = signer
            .sign(&request, &creds, &SignContext::new("https://h"))
            .unwrap();
        assert_ne!(a.url, b.url);
        assert_eq!(a.url.len(), b.url.len());
    }
}
