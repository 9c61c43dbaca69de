//! Authentication building blocks.
//!
//! This module provides:
//! - Credential management with secure secret storage
//! - Nonce generation for replay attack prevention
//! - HMAC digests and signature encodings used by the signing patterns

mod credentials;
mod nonce;
mod signature;

pub use credentials::{Credentials, EnvCredentials};
pub use nonce::{FixedNonce, IncreasingNonce, NonceProvider};
pub use signature::{
    Digest, Encoding, SecretEncoding, encode, hmac_bytes, sha256, sha512_hex, sign,
};
