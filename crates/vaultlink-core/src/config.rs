//! Client configuration.
//!
//! Configuration is read from environment variables (see [`Config::from_env`])
//! and validated up front: a missing field for the selected authentication
//! mode is a [`VaultError::Configuration`] at construction, never at call time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::api::error::{Result, VaultError};
use crate::auth::credentials::{Credentials, OAuthCredentials, PasswordCredentials};
use crate::auth::oauth::{ClientCredentials, StaticToken, TokenSource};

/// Application name used for cache directory paths
const APP_NAME: &str = "vaultlink";

pub const DEFAULT_API_VERSION: &str = "v25.1";

pub const DEFAULT_OAUTH_LOGIN_URL: &str = "https://login.veevavault.com";

pub const DEFAULT_CLIENT_ID: &str = "vaultlink";

/// HTTP request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Renew sessions this long before they expire.
const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base vault URL, always with a scheme and without a trailing slash.
    pub base_url: String,
    pub api_version: String,
    pub credentials: Credentials,
    /// Value of the `X-VaultAPI-ClientID` header.
    pub client_id: String,
    pub oauth_login_url: String,
    pub timeout: Duration,
    pub refresh_threshold: Duration,
    /// Automatic retries for rate-limited calls. Zero raises immediately.
    pub rate_limit_retries: u32,
    /// Directory for the persisted session. `None` disables persistence.
    pub session_cache_dir: Option<PathBuf>,
}

impl Config {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            api_version: DEFAULT_API_VERSION.to_string(),
            credentials,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            oauth_login_url: DEFAULT_OAUTH_LOGIN_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            rate_limit_retries: 0,
            session_cache_dir: None,
        })
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str, mode: &str| {
            get(key).ok_or_else(|| {
                VaultError::Configuration(format!("{} is required for {} authentication", key, mode))
            })
        };

        let base_url = get("VAULT_URL")
            .ok_or_else(|| VaultError::Configuration("VAULT_URL is required".to_string()))?;

        let mode = get("VAULT_AUTH_MODE").unwrap_or_else(|| "password".to_string());
        let credentials = match mode.to_ascii_lowercase().as_str() {
            "password" | "basic" => Credentials::Password(PasswordCredentials::new(
                require("VAULT_USERNAME", "password")?,
                require("VAULT_PASSWORD", "password")?,
            )),
            "oauth" | "oauth2" | "oidc" => {
                let profile_id = require("VAULT_OAUTH_PROFILE_ID", "oauth")?;
                let lifetime = parse_number::<u64>(&get, "VAULT_OAUTH_TOKEN_LIFETIME_SECS")?;

                let token_source: Arc<dyn TokenSource> =
                    match (get("VAULT_OAUTH_ACCESS_TOKEN"), get("VAULT_OAUTH_TOKEN_URL")) {
                        (Some(token), _) => Arc::new(StaticToken::new(token, lifetime)),
                        (None, Some(token_url)) => Arc::new(ClientCredentials::new(
                            token_url,
                            require("VAULT_OAUTH_CLIENT_ID", "oauth")?,
                            require("VAULT_OAUTH_CLIENT_SECRET", "oauth")?,
                            get("VAULT_OAUTH_SCOPE"),
                        )),
                        (None, None) => {
                            return Err(VaultError::Configuration(
                                "oauth authentication needs VAULT_OAUTH_ACCESS_TOKEN or VAULT_OAUTH_TOKEN_URL"
                                    .to_string(),
                            ))
                        }
                    };

                let fallback = match (get("VAULT_USERNAME"), get("VAULT_PASSWORD")) {
                    (Some(user), Some(pass)) => Some(PasswordCredentials::new(user, pass)),
                    _ => None,
                };

                Credentials::OAuth(OAuthCredentials {
                    profile_id,
                    token_source,
                    client_id: get("VAULT_OAUTH_CLIENT_ID"),
                    fallback,
                })
            }
            other => {
                return Err(VaultError::Configuration(format!(
                    "unknown VAULT_AUTH_MODE '{}' (expected password or oauth)",
                    other
                )))
            }
        };

        Self::with_lookup_settings(&base_url, credentials, &get)
    }

    /// Like [`Config::from_lookup`], but with credentials supplied by the
    /// caller instead of read from the variables.
    pub fn from_lookup_with_credentials<F>(lookup: F, credentials: Credentials) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let base_url = get("VAULT_URL")
            .ok_or_else(|| VaultError::Configuration("VAULT_URL is required".to_string()))?;
        Self::with_lookup_settings(&base_url, credentials, &get)
    }

    fn with_lookup_settings(
        base_url: &str,
        credentials: Credentials,
        get: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(base_url, credentials)?;

        if let Some(version) = get("VAULT_API_VERSION") {
            config = config.with_api_version(version);
        }
        if let Some(client_id) = get("VAULT_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(login_url) = get("VAULT_OAUTH_LOGIN_URL") {
            config.oauth_login_url = normalize_base_url(&login_url)?;
        }
        if let Some(secs) = parse_number::<u64>(get, "VAULT_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_number::<u64>(get, "VAULT_REFRESH_THRESHOLD_SECS")? {
            config.refresh_threshold = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_number::<u32>(get, "VAULT_RATE_LIMIT_RETRIES")? {
            config.rate_limit_retries = retries;
        }

        let cache_enabled = match get("VAULT_SESSION_CACHE") {
            Some(flag) => parse_bool("VAULT_SESSION_CACHE", &flag)?,
            None => false,
        };
        if cache_enabled {
            let dir = match get("VAULT_SESSION_CACHE_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => default_cache_dir()?,
            };
            config.session_cache_dir = Some(dir);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.api_version = if version.starts_with('v') {
            version
        } else {
            format!("v{}", version)
        };
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_rate_limit_retries(mut self, retries: u32) -> Self {
        self.rate_limit_retries = retries;
        self
    }

    #[must_use]
    pub fn with_session_cache(mut self, dir: PathBuf) -> Self {
        self.session_cache_dir = Some(dir);
        self
    }

    pub fn with_oauth_login_url(mut self, url: &str) -> Result<Self> {
        self.oauth_login_url = normalize_base_url(url)?;
        Ok(self)
    }

    /// Host part of the base URL, used to key persisted sessions.
    pub fn host(&self) -> String {
        host_of(&self.base_url)
    }

    /// Absolute URL for a versioned API path, e.g. `api_url("query")`.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.base_url,
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    /// Versioned path relative to the base URL, e.g. `/api/v25.1/query`.
    pub fn api_path(&self, path: &str) -> String {
        format!("/api/{}/{}", self.api_version, path.trim_start_matches('/'))
    }
}

/// Default session cache location: `<user cache dir>/vaultlink`.
pub fn default_cache_dir() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| VaultError::Configuration("could not find cache directory".to_string()))?;
    Ok(cache_dir.join(APP_NAME))
}

/// Host (and port, when explicit) of a normalized base URL.
pub fn host_of(base_url: &str) -> String {
    Url::parse(base_url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| base_url.to_string())
}

/// Prefix `https://` when the scheme is missing and drop trailing slashes.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(VaultError::Configuration("vault URL is empty".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&with_scheme).map_err(|e| {
        VaultError::Configuration(format!("invalid vault URL '{}': {}", raw.trim(), e))
    })?;
    if parsed.host_str().is_none() {
        return Err(VaultError::Configuration(format!(
            "vault URL '{}' has no host",
            raw.trim()
        )));
    }

    Ok(with_scheme)
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match get(key) {
        Some(value) => value.parse::<T>().map(Some).map_err(|_| {
            VaultError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, value))
        }),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(VaultError::Configuration(format!(
            "{} must be true or false, got '{}'",
            key, value
        ))),
    }
}
