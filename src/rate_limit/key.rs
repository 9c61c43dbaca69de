//! Bucket keys.

use crate::auth::Credentials;

/// Whose quota a request draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminator {
    /// Unauthenticated traffic. One shared pool per exchange.
    Public,
    /// Authenticated traffic, isolated per API key.
    ApiKey(String),
}

/// `{exchange, credential}` pair identifying one rate limit bucket.
///
/// Distinct API keys never share a bucket, and all public traffic for an
/// exchange shares exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub exchange: String,
    pub discriminator: Discriminator,
}

impl RateLimitKey {
    pub fn public(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            discriminator: Discriminator::Public,
        }
    }

    pub fn api_key(exchange: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            discriminator: Discriminator::ApiKey(api_key.into()),
        }
    }

    /// The key for a request made with (or without) `credentials`.
    pub fn for_credentials(exchange: impl Into<String>, credentials: Option<&Credentials>) -> Self {
        match credentials {
            Some(creds) => Self::api_key(exchange, creds.api_key.clone()),
            None => Self::public(exchange),
        }
    }

    pub fn is_public(&self) -> bool {
        self.discriminator == Discriminator::Public
    }
}

impl std::fmt::Display for RateLimitKey {
    /// API keys are shortened to their first four characters.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.discriminator {
            Discriminator::Public => write!(f, "{}:public", self.exchange),
            Discriminator::ApiKey(key) => {
                let prefix: String = key.chars().take(4).collect();
                write!(f, "{}:key:{prefix}***", self.exchange)
            }
        }
    }
}
