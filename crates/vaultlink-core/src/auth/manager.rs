//! Session lifecycle: authenticate, refresh, keep-alive, logout.
//!
//! The [`AuthManager`] owns the only mutable shared state of the client, the
//! current [`Session`]. All network authentication is serialized through one
//! async mutex so that concurrent callers collapse onto a single in-flight
//! request; reads of a healthy session never touch that mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::error::{ErrorEnvelope, Result, VaultError};
use crate::api::response::{ResponseStatus, VaultResponse};
use crate::api::transport::{HttpRequest, HttpResponse, RequestBody, ReqwestTransport, Transport};
use crate::config::Config;

use super::credentials::{Credentials, OAuthCredentials, PasswordCredentials};
use super::session::{Session, SessionError, SessionStore};

/// Header Vault uses to attribute API traffic to a client application.
pub const CLIENT_ID_HEADER: &str = "x-vaultapi-clientid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "responseStatus")]
    response_status: Option<ResponseStatus>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<i64>,
    #[serde(rename = "vaultIds", default)]
    vault_ids: Vec<VaultInfo>,
}

#[derive(Debug, Deserialize)]
struct VaultInfo {
    id: i64,
    #[serde(default)]
    name: String,
    url: Option<String>,
}

impl From<SessionError> for VaultError {
    fn from(err: SessionError) -> Self {
        VaultError::Authentication(format!("invalid session data: {}", err))
    }
}

pub struct AuthManager {
    config: Config,
    transport: Arc<dyn Transport>,
    current: RwLock<Option<Session>>,
    /// Serializes every network authentication and logout.
    refresh_lock: Mutex<()>,
    /// Bumped whenever the current-session slot is written.
    generation: AtomicU64,
    refresh_threshold: Duration,
    store: Option<SessionStore>,
}

impl AuthManager {
    /// Create a manager backed by a `reqwest` transport honouring the
    /// configured timeout.
    pub fn new(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let refresh_threshold =
            Duration::from_std(config.refresh_threshold).unwrap_or_else(|_| Duration::days(1));

        let store = config
            .session_cache_dir
            .clone()
            .map(|dir| SessionStore::new(dir, config.host()));

        let restored = store.as_ref().and_then(|store| match store.load() {
            Ok(Some(session)) => {
                info!(user_id = session.user_id(), vault_id = session.vault_id(), "Restored persisted session");
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable persisted session");
                None
            }
        });

        Self {
            config,
            transport,
            current: RwLock::new(restored),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            refresh_threshold,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn state(&self) -> AuthState {
        if self.current.read().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Snapshot of the current session without any validity checks.
    pub fn current_session(&self) -> Option<Session> {
        self.current.read().clone()
    }

    /// Check if a session exists and has not expired
    pub fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|s| !s.is_expired(Utc::now()))
    }

    /// Authenticate with the configured credentials and make the result the
    /// current session.
    pub async fn authenticate(&self) -> Result<Session> {
        let _guard = self.refresh_lock.lock().await;
        let session = self.perform_authentication().await?;
        self.install(session.clone());
        Ok(session)
    }

    /// Return a session that is valid and not about to expire, authenticating
    /// when there is none. Concurrent callers share one authentication.
    pub async fn get_session(&self) -> Result<Session> {
        if let Some(session) = self.fresh_session() {
            return Ok(session);
        }

        let _guard = self.refresh_lock.lock().await;

        // Double-check after acquiring lock
        if let Some(session) = self.fresh_session() {
            return Ok(session);
        }

        match self.perform_authentication().await {
            Ok(session) => {
                self.install(session.clone());
                Ok(session)
            }
            Err(e) => match self.unexpired_session() {
                Some(old) => {
                    warn!(error = %e, "Session renewal failed, keeping the current session until it expires");
                    Ok(old)
                }
                None => Err(e),
            },
        }
    }

    /// Re-authenticate unconditionally and replace the current session.
    ///
    /// Callers that queued behind a refresh already in flight get its result
    /// instead of starting another one. On failure the previous session is
    /// left in place.
    pub async fn refresh_session(&self) -> Result<Session> {
        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != seen {
            if let Some(session) = self.fresh_session() {
                debug!("Reusing session from concurrent refresh");
                return Ok(session);
            }
        }

        let session = self.perform_authentication().await?;
        self.install(session.clone());
        Ok(session)
    }

    /// End the session at Vault (best effort) and always forget it locally.
    pub async fn logout(&self) {
        let _guard = self.refresh_lock.lock().await;

        let Some(session) = self.current_session() else {
            debug!("Logout requested without an active session");
            self.clear_persisted();
            return;
        };

        match self.session_headers(&session) {
            Ok(headers) => {
                let mut request = HttpRequest::new(Method::DELETE, self.config.api_url("session"));
                request.headers = headers;
                match self.transport.send(request).await {
                    Ok(response) => match VaultResponse::from_http(&response) {
                        Ok(_) => info!("Logged out of Vault"),
                        Err(e) => warn!(error = %e, "Vault rejected logout, clearing local session anyway"),
                    },
                    Err(e) => warn!(error = %e, "Logout request failed, clearing local session anyway"),
                }
            }
            Err(e) => warn!(error = %e, "Could not build logout request"),
        }

        *self.current.write() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.clear_persisted();
    }

    /// Headers that authenticate a request as the current session.
    pub fn auth_headers(&self) -> Result<HeaderMap> {
        let session = self.current_session().ok_or_else(|| {
            VaultError::Authentication("no active session; call get_session first".to_string())
        })?;
        self.session_headers(&session)
    }

    /// Headers that authenticate a request as `session`.
    pub fn session_headers(&self, session: &Session) -> Result<HeaderMap> {
        let mut headers = self.base_headers()?;
        let mut value = HeaderValue::from_str(session.session_id()).map_err(|_| {
            VaultError::Authentication("session id is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// Ping `/keep-alive` so a password session does not time out.
    /// An invalid-session answer drops the current session.
    pub async fn keep_alive(&self) -> Result<()> {
        let session = self.current_session().ok_or_else(|| {
            VaultError::Authentication("no active session to keep alive".to_string())
        })?;

        let mut request = HttpRequest::new(Method::POST, self.config.api_url("keep-alive"));
        request.headers = self.session_headers(&session)?;

        let response = self.transport.send(request).await?;
        match VaultResponse::from_http(&response) {
            Ok(_) => {
                debug!("Session kept alive");
                Ok(())
            }
            Err(e) => {
                if e.is_session_expired() {
                    self.invalidate(session.session_id());
                }
                Err(e)
            }
        }
    }

    /// Ping keep-alive every `interval` in the background until the handle
    /// is dropped or the manager goes away.
    pub fn spawn_keep_alive(self: &Arc<Self>, interval: StdDuration) -> KeepAliveHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.current_session().is_none() {
                    continue;
                }
                if let Err(e) = manager.keep_alive().await {
                    warn!(error = %e, "Background keep-alive failed");
                }
            }
        });
        KeepAliveHandle { handle }
    }

    /// Drop the current session if it is still `session_id`. Used when a
    /// request reports the session as invalid. Returns whether it was dropped.
    pub fn invalidate(&self, session_id: &str) -> bool {
        let mut current = self.current.write();
        if current.as_ref().map(Session::session_id) != Some(session_id) {
            return false;
        }
        *current = None;
        drop(current);

        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Vault reported the session as invalid, dropping it");
        self.clear_persisted();
        true
    }

    fn fresh_session(&self) -> Option<Session> {
        let now = Utc::now();
        self.current
            .read()
            .as_ref()
            .filter(|s| !s.is_expired(now) && !s.should_refresh(now, self.refresh_threshold))
            .cloned()
    }

    fn unexpired_session(&self) -> Option<Session> {
        let now = Utc::now();
        self.current
            .read()
            .as_ref()
            .filter(|s| !s.is_expired(now))
            .cloned()
    }

    fn install(&self, session: Session) {
        info!(
            user_id = session.user_id(),
            vault_id = session.vault_id(),
            vault = session.vault_name(),
            auth_mode = session.auth_mode().unwrap_or("unknown"),
            expires_at = ?session.expires_at(),
            "Session established"
        );

        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&session) {
                warn!(error = %e, "Failed to persist session");
            }
        }

        *self.current.write() = Some(session);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_persisted(&self) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to remove persisted session");
            }
        }
    }

    fn base_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client_id = HeaderValue::from_str(&self.config.client_id).map_err(|_| {
            VaultError::Configuration("client id is not a valid header value".to_string())
        })?;
        headers.insert(HeaderName::from_static(CLIENT_ID_HEADER), client_id);
        Ok(headers)
    }

    async fn perform_authentication(&self) -> Result<Session> {
        match &self.config.credentials {
            Credentials::Password(creds) => self.password_session(creds, "password").await,
            Credentials::OAuth(oauth) => match self.oauth_session(oauth).await {
                Ok(session) => Ok(session),
                Err(e) => match oauth.fallback {
                    Some(ref fallback) => {
                        warn!(error = %e, username = %fallback.username, "OAuth session exchange failed, using service account");
                        self.password_session(fallback, "password_fallback").await
                    }
                    None => Err(e),
                },
            },
            Credentials::SessionOnly => {
                debug!("No credentials configured, cannot start a new session");
                Err(VaultError::Authentication(
                    "the cached session can no longer be used and no password is configured; log in again"
                        .to_string(),
                ))
            }
        }
    }

    async fn password_session(&self, creds: &PasswordCredentials, mode: &str) -> Result<Session> {
        debug!(username = %creds.username, "Authenticating with username and password");

        let mut request = HttpRequest::new(Method::POST, self.config.api_url("auth"));
        request.headers = self.base_headers()?;
        request.body = RequestBody::Form(vec![
            ("username".to_string(), creds.username.clone()),
            ("password".to_string(), creds.password().to_string()),
        ]);

        let response = self.transport.send(request).await?;
        Self::session_from_response(&response, mode, None)
    }

    async fn oauth_session(&self, oauth: &OAuthCredentials) -> Result<Session> {
        let token = oauth
            .token_source
            .access_token(self.transport.as_ref())
            .await?;

        debug!(profile_id = %oauth.profile_id, "Exchanging OAuth token for a Vault session");

        let url = format!(
            "{}/auth/oauth/session/{}",
            self.config.oauth_login_url, oauth.profile_id
        );
        let mut request = HttpRequest::new(Method::POST, url);
        request.headers = self.base_headers()?;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.secret())).map_err(|_| {
            VaultError::Authentication("access token is not a valid header value".to_string())
        })?;
        bearer.set_sensitive(true);
        request.headers.insert(AUTHORIZATION, bearer);

        let mut form = vec![("vaultDNS".to_string(), self.config.host())];
        if let Some(ref client_id) = oauth.client_id {
            form.push(("client_id".to_string(), client_id.clone()));
        }
        request.body = RequestBody::Form(form);

        let response = self.transport.send(request).await?;
        Self::session_from_response(&response, "oauth", token.expires_in)
    }

    /// Build a session from an auth endpoint response. The first vault in
    /// `vaultIds` is used, in the order the server returned them.
    fn session_from_response(
        response: &HttpResponse,
        mode: &str,
        expires_in: Option<u64>,
    ) -> Result<Session> {
        let rejected = || {
            let envelope = ErrorEnvelope::from_body(Some(response.status), &response.body, None);
            VaultError::Authentication(envelope.to_string())
        };

        if !response.is_success() {
            return Err(rejected());
        }

        let body: Value = serde_json::from_slice(&response.body).map_err(|_| rejected())?;
        let auth: AuthResponse = serde_json::from_value(body)
            .map_err(|e| VaultError::Authentication(format!("malformed auth response: {}", e)))?;

        if auth.response_status != Some(ResponseStatus::Success) {
            return Err(rejected());
        }

        let session_id = auth
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| VaultError::Authentication("auth response is missing sessionId".to_string()))?;
        let user_id = auth
            .user_id
            .ok_or_else(|| VaultError::Authentication("auth response is missing userId".to_string()))?;
        let vault = auth.vault_ids.first().ok_or_else(|| {
            VaultError::Authentication("no vaults available for this user".to_string())
        })?;

        let now = Utc::now();
        let mut session = Session::new(session_id, user_id, vault.id, vault.name.clone(), now)?
            .with_metadata("auth_mode", mode)
            .with_metadata("vault_count", auth.vault_ids.len());
        if let Some(ref url) = vault.url {
            session = session.with_metadata("vault_url", url.clone());
        }
        if let Some(secs) = expires_in {
            let expires_at = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .ok_or_else(|| {
                    VaultError::Authentication(format!("token lifetime of {}s is out of range", secs))
                })?;
            session = session.with_expires_at(expires_at)?;
        }

        Ok(session)
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("base_url", &self.config.base_url)
            .field("auth_mode", &self.config.credentials.mode())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Background keep-alive task. Aborted when dropped.
#[derive(Debug)]
pub struct KeepAliveHandle {
    handle: JoinHandle<()>,
}

impl KeepAliveHandle {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
