use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use keyring::Entry;
use secrecy::{ExposeSecret, SecretString};

use super::oauth::TokenSource;

const SERVICE_NAME: &str = "vaultlink";

/// Username/password pair for `POST /api/{version}/auth`.
#[derive(Clone)]
pub struct PasswordCredentials {
    pub username: String,
    password: SecretString,
}

impl PasswordCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    pub fn secret(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// OAuth2/OIDC session exchange, with an optional service-account
/// password used when the exchange fails.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub profile_id: String,
    pub token_source: Arc<dyn TokenSource>,
    /// Optional `client_id` sent with the session exchange.
    pub client_id: Option<String>,
    pub fallback: Option<PasswordCredentials>,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("profile_id", &self.profile_id)
            .field("token_source", &self.token_source)
            .field("client_id", &self.client_id)
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Credentials {
    Password(PasswordCredentials),
    OAuth(OAuthCredentials),
    /// Only a persisted session is available. Anything that would need a
    /// new session fails locally instead of contacting Vault.
    SessionOnly,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password(PasswordCredentials::new(username, password))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credentials::Password(_) => "password",
            Credentials::OAuth(_) => "oauth",
            Credentials::SessionOnly => "session_only",
        }
    }
}

/// A Vault password kept in the OS keychain.
///
/// Entries are keyed by `username@host`, so one account on two vaults keeps
/// two passwords.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    account: String,
}

impl CredentialStore {
    pub fn new(username: &str, host: &str) -> Self {
        Self {
            account: format!("{}@{}", username, host),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account)
            .with_context(|| format!("Failed to open keychain entry for {}", self.account))
    }

    pub fn save(&self, password: &SecretString) -> Result<()> {
        self.entry()?
            .set_password(password.expose_secret())
            .context("Failed to store password in keychain")
    }

    /// The stored password, or `None` when the keychain has no entry.
    pub fn load(&self) -> Result<Option<SecretString>> {
        match self.entry()?.get_password() {
            Ok(password) => Ok(Some(SecretString::from(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read password from keychain"),
        }
    }

    /// Remove the stored password. Returns whether there was one.
    pub fn forget(&self) -> Result<bool> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e).context("Failed to delete password from keychain"),
        }
    }
}
