//! Generic Vault API dispatcher.
//!
//! Every resource call goes through [`VaultClient::execute`], which resolves
//! the endpoint, attaches the current session, sends the request through the
//! transport, and turns both hard HTTP failures and soft failures embedded
//! in a 200 into typed [`VaultError`]s.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE,
};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::AuthManager;
use crate::config::Config;

use super::error::{ErrorEnvelope, Result, VaultError};
use super::response::{ParsedResult, RawResponse, ResponseFormat, VaultResponse};
use super::transport::{HttpRequest, HttpResponse, RequestBody, Transport};

/// Initial backoff delay in milliseconds for rate limiting when Vault does
/// not send a Retry-After hint.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upper bound on any single rate-limit wait, including server hints.
const MAX_BACKOFF_MS: u64 = 60_000;

/// One call through the dispatcher.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Relative path (resolved against the vault URL) or absolute URL.
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: Vec::new(),
            params: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    #[must_use]
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(pairs);
        self
    }
}

/// Vault API client.
/// Clone is cheap - the manager and transport are shared behind `Arc`s.
#[derive(Clone)]
pub struct VaultClient {
    auth: Arc<AuthManager>,
    transport: Arc<dyn Transport>,
}

impl VaultClient {
    /// Build a client that sends requests through the manager's transport.
    pub fn new(auth: Arc<AuthManager>) -> Self {
        let transport = auth.transport();
        Self { auth, transport }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        Ok(Self::new(Arc::new(AuthManager::new(config)?)))
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn config(&self) -> &Config {
        self.auth.config()
    }

    /// Versioned API path, e.g. `api_path("query")` -> `/api/v25.1/query`.
    pub fn api_path(&self, path: &str) -> String {
        self.config().api_path(path)
    }

    /// Absolute URLs pass through; anything else is joined to the vault URL.
    pub fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.config().base_url,
                endpoint.trim_start_matches('/')
            )
        }
    }

    /// Send a request and return the result in the requested format.
    pub async fn execute(&self, request: ApiRequest, format: ResponseFormat) -> Result<ParsedResult> {
        match format {
            ResponseFormat::Json => self.call(request).await.map(ParsedResult::Json),
            ResponseFormat::Raw => self.call_raw(request).await.map(ParsedResult::Raw),
        }
    }

    /// Send a request and parse the JSON envelope.
    pub async fn call(&self, request: ApiRequest) -> Result<VaultResponse> {
        self.dispatch(request, ResponseFormat::Json, VaultResponse::from_http)
            .await
    }

    /// Send a request and return the body untouched (file downloads).
    pub async fn call_raw(&self, request: ApiRequest) -> Result<RawResponse> {
        self.dispatch(request, ResponseFormat::Raw, raw_response).await
    }

    async fn dispatch<T>(
        &self,
        request: ApiRequest,
        format: ResponseFormat,
        interpret: fn(&HttpResponse) -> Result<T>,
    ) -> Result<T> {
        let url = self.resolve_url(&request.endpoint);
        let caller_headers = Self::caller_headers(&request.headers)?;

        // An explicit Authorization header wins over the managed session.
        let session = if caller_headers.contains_key(AUTHORIZATION) {
            None
        } else {
            Some(self.auth.get_session().await?)
        };

        let max_retries = self.config().rate_limit_retries;
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut headers = match session {
                Some(ref s) => self.auth.session_headers(s)?,
                None => HeaderMap::new(),
            };
            if format == ResponseFormat::Raw && !caller_headers.contains_key(ACCEPT) {
                headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
            }
            for (name, value) in caller_headers.iter() {
                headers.insert(name.clone(), value.clone());
            }

            let http_request = HttpRequest {
                method: request.method.clone(),
                url: url.clone(),
                headers,
                query: request.params.clone(),
                body: request.body.clone(),
            };

            let response = self.transport.send(http_request).await?;
            debug!(method = %request.method, url = %url, status = response.status, "Vault call finished");

            match interpret(&response) {
                Err(VaultError::RateLimit(envelope)) if retries < max_retries => {
                    retries += 1;
                    let wait = rate_limit_wait(envelope.retry_after_seconds, backoff_ms);
                    warn!(url = %url, retry = retries, wait_ms = wait.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(wait).await;
                    backoff_ms = next_backoff(backoff_ms);
                }
                Err(e) if e.is_session_expired() => {
                    if let Some(ref s) = session {
                        self.auth.invalidate(s.session_id());
                    }
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Run `op`; if it fails with `SessionExpired`, refresh the session once
    /// and run it again. Any other error is returned unchanged.
    pub async fn with_session_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if e.is_session_expired() => {
                info!("Session rejected by Vault, re-authenticating and retrying once");
                self.auth.refresh_session().await?;
                op().await
            }
            other => other,
        }
    }

    // ===== Resource calls =====

    /// Run a VQL query.
    pub async fn query(&self, vql: &str) -> Result<VaultResponse> {
        let request = ApiRequest::post(self.api_path("query"))
            .form(vec![("q".to_string(), vql.to_string())]);
        self.call(request).await
    }

    /// Retrieve document metadata (latest version).
    pub async fn retrieve_document(&self, doc_id: i64) -> Result<VaultResponse> {
        let request = ApiRequest::get(self.api_path(&format!("objects/documents/{}", doc_id)));
        self.call(request).await
    }

    /// Retrieve one Vault object record.
    pub async fn retrieve_object_record(&self, object_name: &str, record_id: &str) -> Result<VaultResponse> {
        let request = ApiRequest::get(
            self.api_path(&format!("vobjects/{}/{}", object_name, record_id)),
        );
        self.call(request).await
    }

    /// Download the source file of a document's latest version.
    pub async fn download_document_file(&self, doc_id: i64) -> Result<RawResponse> {
        let request = ApiRequest::get(self.api_path(&format!("objects/documents/{}/file", doc_id)));
        self.call_raw(request).await
    }

    fn caller_headers(pairs: &[(String, String)]) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                VaultError::Configuration(format!("invalid header name '{}'", name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                VaultError::Configuration(format!("invalid value for header '{}'", name))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("base_url", &self.config().base_url)
            .finish_non_exhaustive()
    }
}

/// Keep the body of a binary endpoint as-is. Failures on these endpoints
/// still come back as JSON envelopes, either with an error status or as a
/// non-SUCCESS `responseStatus` in a 200.
fn raw_response(response: &HttpResponse) -> Result<RawResponse> {
    let content_type = response.header(CONTENT_TYPE.as_str()).map(String::from);
    let soft_failure = content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("application/json"))
        && serde_json::from_slice::<Value>(&response.body)
            .ok()
            .and_then(|v| v.get("responseStatus").and_then(Value::as_str).map(|s| s != "SUCCESS"))
            .unwrap_or(false);

    if !response.is_success() || soft_failure {
        return Err(VaultError::from_envelope(ErrorEnvelope::from_body(
            Some(response.status),
            &response.body,
            response.retry_after(),
        )));
    }

    Ok(RawResponse {
        status: response.status,
        file_name: response
            .header(CONTENT_DISPOSITION.as_str())
            .and_then(parse_file_name),
        content_type,
        body: response.body.clone(),
    })
}

/// Extract `filename` from a Content-Disposition header value.
fn parse_file_name(disposition: &str) -> Option<String> {
    disposition
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

/// How long to wait before retrying a rate-limited call: the server's
/// Retry-After hint when present, else the current backoff, capped.
fn rate_limit_wait(retry_after_seconds: Option<u64>, backoff_ms: u64) -> Duration {
    let ms = retry_after_seconds
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(backoff_ms);
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

fn next_backoff(backoff_ms: u64) -> u64 {
    backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS)
}
