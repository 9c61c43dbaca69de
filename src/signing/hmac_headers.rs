use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::signing::config::{SigningConfig, TimestampUnit, header_or};
use crate::signing::encode::{RequestParts, join_url, path_with_query};
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

/// `timestamp + METHOD + path(?query) + body`, everything in headers.
#[derive(Debug, Clone)]
pub struct HmacHeaders {
    api_key_header: String,
    signature_header: String,
    timestamp_header: String,
    recv_window_header: String,
    recv_window: Option<u64>,
    digest: Digest,
    encoding: Encoding,
    timestamp_unit: TimestampUnit,
}

impl HmacHeaders {
    pub(crate) fn from_config(config: &SigningConfig) -> Self {
        Self {
            api_key_header: header_or(&config.api_key_header, "X-API-KEY"),
            signature_header: header_or(&config.signature_header, "X-SIGNATURE"),
            timestamp_header: header_or(&config.timestamp_header, "X-TIMESTAMP"),
            recv_window_header: header_or(&config.recv_window_header, "X-RECV-WINDOW"),
            recv_window: config.recv_window,
            digest: config.digest.unwrap_or(Digest::Sha256),
            encoding: config.encoding.unwrap_or(Encoding::Hex),
            timestamp_unit: config.timestamp_unit.unwrap_or_default(),
        }
    }

    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = self.timestamp_unit.from_ms(ctx.clock.now_ms()).to_string();
        let parts = RequestParts::json(request)?;
        let payload = format!(
            "{timestamp}{}{}{}",
            request.method.as_str(),
            path_with_query(&request.path, &parts.query),
            parts.body_str()
        );
        let signature = sign(self.digest, self.encoding, credentials.expose_secret(), &payload)?;

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (self.api_key_header.clone(), credentials.api_key.clone()),
            (self.signature_header.clone(), signature),
            (self.timestamp_header.clone(), timestamp),
        ];
        if let Some(window) = self.recv_window {
            headers.push((self.recv_window_header.clone(), window.to_string()));
        }

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &parts.query),
            method: request.method.clone(),
            headers,
            body: parts.body,
        })
    }
}
