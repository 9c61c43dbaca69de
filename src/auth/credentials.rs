//! Exchange API credentials.

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// API credentials for a single exchange account.
///
/// The secret and the optional passphrase are never printed by `Debug`.
#[derive(Clone)]
pub struct Credentials {
    /// The API key (public identifier)
    pub api_key: String,
    secret: SecretString,
    password: Option<SecretString>,
    /// Route requests to the exchange's sandbox/testnet URLs
    pub sandbox: bool,
    /// API key version, used by patterns that sign the passphrase (defaults to 2)
    pub key_version: u8,
    /// Account identifier required by a handful of exchanges
    pub uid: Option<String>,
}

impl Credentials {
    /// Create credentials from an API key and secret.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: SecretString::from(secret.into()),
            password: None,
            sandbox: false,
            key_version: 2,
            uid: None,
        }
    }

    /// Attach a passphrase.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Target the sandbox environment.
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set the API key version.
    pub fn with_key_version(mut self, version: u8) -> Self {
        self.key_version = version;
        self
    }

    /// Set the account uid.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Get the API secret for signing.
    ///
    /// This method exposes the secret - use carefully.
    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }

    /// Get the passphrase, if one was configured.
    pub fn expose_password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    /// Whether a passphrase was configured.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("sandbox", &self.sandbox)
            .field("key_version", &self.key_version)
            .field("uid", &self.uid)
            .finish()
    }
}

/// Loads credentials from `{PREFIX}_API_KEY`, `{PREFIX}_SECRET`,
/// `{PREFIX}_PASSWORD` and `{PREFIX}_SANDBOX`.
///
/// ```rust,no_run
/// use exchange_pipeline::auth::EnvCredentials;
///
/// let okx = EnvCredentials::try_from_env("OKX");
/// ```
pub struct EnvCredentials;

impl EnvCredentials {
    /// Read credentials for `prefix`, failing if the key or secret is missing.
    pub fn from_env(prefix: &str) -> Result<Credentials, ConfigError> {
        let prefix = prefix.to_ascii_uppercase();
        let key_var = format!("{prefix}_API_KEY");
        let secret_var = format!("{prefix}_SECRET");

        let api_key = std::env::var(&key_var).map_err(|_| ConfigError::MissingEnv(key_var))?;
        let secret =
            std::env::var(&secret_var).map_err(|_| ConfigError::MissingEnv(secret_var))?;

        let mut credentials = Credentials::new(api_key, secret);
        if let Ok(password) = std::env::var(format!("{prefix}_PASSWORD")) {
            credentials = credentials.with_password(password);
        }
        if let Ok(sandbox) = std::env::var(format!("{prefix}_SANDBOX")) {
            credentials.sandbox = matches!(sandbox.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(uid) = std::env::var(format!("{prefix}_UID")) {
            credentials = credentials.with_uid(uid);
        }
        Ok(credentials)
    }

    /// Like [`EnvCredentials::from_env`], returning `None` when variables are unset.
    pub fn try_from_env(prefix: &str) -> Option<Credentials> {
        Self::from_env(prefix).ok()
    }
}
