//! OAuth2/OIDC access token sources.
//!
//! Vault does not issue OAuth tokens itself. The manager obtains an access
//! token from a [`TokenSource`] and exchanges it for a Vault session at the
//! login service.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::api::error::{ErrorEnvelope, Result, VaultError};
use crate::api::transport::{HttpRequest, RequestBody, Transport};

/// An access token and its declared lifetime.
#[derive(Clone)]
pub struct AccessToken {
    token: SecretString,
    pub expires_in: Option<u64>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_in,
        }
    }

    pub fn secret(&self) -> &str {
        self.token.expose_secret()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync + fmt::Debug {
    /// Produce a fresh access token.
    async fn access_token(&self, transport: &dyn Transport) -> Result<AccessToken>;
}

/// A pre-issued token, e.g. handed over by an identity provider CLI.
///
/// The declared lifetime counts from `issued_at`, so every exchange hands
/// out only what is left of it.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: AccessToken,
    issued_at: DateTime<Utc>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            token: AccessToken::new(token, expires_in),
            issued_at: Utc::now(),
        }
    }

    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    /// Seconds of validity left at `now`; `None` when no lifetime was declared.
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Option<u64> {
        let lifetime = self.token.expires_in?;
        let elapsed = u64::try_from((now - self.issued_at).num_seconds()).unwrap_or(0);
        Some(lifetime.saturating_sub(elapsed))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self, _transport: &dyn Transport) -> Result<AccessToken> {
        match self.remaining_lifetime(Utc::now()) {
            Some(0) => Err(VaultError::Authentication(
                "configured access token has expired".to_string(),
            )),
            remaining => Ok(AccessToken::new(self.token.secret(), remaining)),
        }
    }
}

/// `grant_type=client_credentials` against an OIDC token endpoint.
#[derive(Clone)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    client_secret: SecretString,
    pub scope: Option<String>,
}

impl ClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope,
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn access_token(&self, transport: &dyn Transport) -> Result<AccessToken> {
        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            (
                "client_secret".to_string(),
                self.client_secret.expose_secret().to_string(),
            ),
        ];
        if let Some(ref scope) = self.scope {
            form.push(("scope".to_string(), scope.clone()));
        }

        let mut request = HttpRequest::new(Method::POST, &self.token_url);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        request.body = RequestBody::Form(form);

        let response = transport.send(request).await?;
        if !response.is_success() {
            let envelope = ErrorEnvelope::from_body(Some(response.status), &response.body, None);
            return Err(VaultError::Authentication(format!(
                "token endpoint rejected client credentials: {}",
                envelope
            )));
        }

        let parsed: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            VaultError::Authentication(format!("malformed token endpoint response: {}", e))
        })?;
        debug!(expires_in = ?parsed.expires_in, "Obtained OAuth access token");

        Ok(AccessToken::new(parsed.access_token, parsed.expires_in))
    }
}
