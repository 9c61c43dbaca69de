//! HMAC primitives shared by the signing patterns.
//!
//! Every pattern reduces to "HMAC some payload with some digest and encode it
//! as hex or base64". The pieces live here so each pattern only has to describe
//! its payload and where the result goes.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::signing::SigningError;

/// HMAC digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Digest {
    Sha256,
    Sha384,
    Sha512,
}

/// Text encoding of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Lowercase hexadecimal
    Hex,
    /// Standard base64 with padding
    Base64,
}

/// How the API secret is turned into HMAC key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretEncoding {
    /// The secret's UTF-8 bytes are the key.
    #[default]
    Raw,
    /// The secret is base64 and must be decoded first.
    Base64,
}

impl SecretEncoding {
    /// Produce the HMAC key bytes for `secret`.
    pub fn key_bytes(self, secret: &str) -> Result<Vec<u8>, SigningError> {
        match self {
            Self::Raw => Ok(secret.as_bytes().to_vec()),
            Self::Base64 => BASE64
                .decode(secret)
                .map_err(|_| SigningError::InvalidSecret("API secret must be valid base64.".into())),
        }
    }
}

/// Compute a raw HMAC over `message`.
pub fn hmac_bytes(digest: Digest, key: &[u8], message: &[u8]) -> Result<Vec<u8>, SigningError> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut mac = <M as Mac>::new_from_slice(key)
            .map_err(|e| SigningError::InvalidSecret(format!("Invalid HMAC key: {e}")))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match digest {
        Digest::Sha256 => run::<Hmac<Sha256>>(key, message),
        Digest::Sha384 => run::<Hmac<Sha384>>(key, message),
        Digest::Sha512 => run::<Hmac<Sha512>>(key, message),
    }
}

/// Encode bytes as hex or base64.
pub fn encode(encoding: Encoding, bytes: &[u8]) -> String {
    match encoding {
        Encoding::Hex => hex::encode(bytes),
        Encoding::Base64 => BASE64.encode(bytes),
    }
}

/// HMAC `message` with the UTF-8 bytes of `secret` and encode the result.
pub fn sign(
    digest: Digest,
    encoding: Encoding,
    secret: &str,
    message: &str,
) -> Result<String, SigningError> {
    let mac = hmac_bytes(digest, secret.as_bytes(), message.as_bytes())?;
    Ok(encode(encoding, &mac))
}

/// Lowercase hex SHA-512 of `data`.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_vector() {
        // RFC 4231 test case 2.
        let mac = hmac_bytes(Digest::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_digest_lengths() {
        for (digest, hex_len, b64_len) in [
            (Digest::Sha256, 64, 44),
            (Digest::Sha384, 96, 64),
            (Digest::Sha512, 128, 88),
        ] {
            assert_eq!(sign(digest, Encoding::Hex, "k", "m").unwrap().len(), hex_len);
            assert_eq!(sign(digest, Encoding::Base64, "k", "m").unwrap().len(), b64_len);
        }
    }

    #[test]
    fn test_empty_secret_does_not_fail() {
        let sig = sign(Digest::Sha256, Encoding::Hex, "", "payload").unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn test_secret_encoding() {
        assert_eq!(SecretEncoding::Raw.key_bytes("abc").unwrap(), b"abc");
        assert_eq!(
            SecretEncoding::Base64.key_bytes(&BASE64.encode("abc")).unwrap(),
            b"abc"
        );
        assert!(matches!(
            SecretEncoding::Base64.key_bytes("not base64!!"),
            Err(SigningError::InvalidSecret(_))
        ));
    }
}
