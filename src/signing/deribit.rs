use crate::auth::{Credentials, Digest, Encoding, sign};
use crate::signing::encode::{RequestParts, join_url, path_with_query};
use crate::signing::{Request, SignContext, SignedRequest, SigningError};

/// Deribit's `deri-hmac-sha256` Authorization header.
///
/// ```text
/// ts \n nonce \n METHOD \n path?query \n body \n
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DeribitSigner;

impl DeribitSigner {
    pub fn sign(
        &self,
        request: &Request,
        credentials: &Credentials,
        ctx: &SignContext,
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = ctx.clock.now_ms();
        let nonce = ctx.nonce.next_nonce();
        let parts = RequestParts::json(request)?;
        let uri = path_with_query(&request.path, &parts.query);
        let payload = format!(
            "{timestamp}\n{nonce}\n{}\n{uri}\n{}\n",
            request.method.as_str(),
            parts.body_str()
        );
        let signature = sign(
            Digest::Sha256,
            Encoding::Hex,
            credentials.expose_secret(),
            &payload,
        )?;

        let authorization = format!(
            "deri-hmac-sha256 id={},ts={timestamp},sig={signature},nonce={nonce}",
            credentials.api_key
        );

        Ok(SignedRequest {
            url: join_url(&ctx.base_url, &request.path, &parts.query),
            method: request.method.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), authorization),
            ],
            body: parts.body,
        })
    }
}
