use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length for raw response bodies kept in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Normalized view of a failed Vault API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Vendor error code such as `INVALID_SESSION_ID`. Empty when the
    /// response carried no typed error.
    pub error_code: String,
    pub message: String,
    pub http_status: Option<u16>,
    /// Raw response fragment kept for diagnostics.
    pub context: Value,
    /// Only populated for rate-limit errors.
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
    #[serde(rename = "responseMessage")]
    response_message: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            http_status: None,
            context: Value::Null,
            retry_after_seconds: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    /// Build an envelope from an already-parsed Vault JSON body.
    ///
    /// The first entry of `errors` wins. Bodies that only carry
    /// `responseMessage` produce an envelope with an empty error code.
    pub fn from_json(status: Option<u16>, body: &Value, retry_after: Option<u64>) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_value(body.clone()).ok();

        let (error_code, message) = match parsed {
            Some(ErrorBody { errors, .. }) if !errors.is_empty() => {
                let first = &errors[0];
                (first.error_type.clone(), first.message.clone())
            }
            Some(ErrorBody {
                response_message: Some(msg),
                ..
            }) => (String::new(), msg),
            _ => (String::new(), Self::truncate_body(&body.to_string())),
        };

        let mut envelope = Self {
            error_code,
            message,
            http_status: status,
            context: body.clone(),
            retry_after_seconds: None,
        };
        if classify(&envelope) == ErrorKind::RateLimit {
            envelope.retry_after_seconds = retry_after;
        }
        envelope
    }

    /// Build an envelope from a raw response body that may not be JSON.
    pub fn from_body(status: Option<u16>, body: &[u8], retry_after: Option<u64>) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(json) if json.is_object() => Self::from_json(status, &json, retry_after),
            _ => {
                let text = Self::truncate_body(&String::from_utf8_lossy(body));
                let message = if text.is_empty() {
                    status
                        .map(|s| format!("HTTP {}", s))
                        .unwrap_or_else(|| "empty response".to_string())
                } else {
                    text.clone()
                };
                let mut envelope = Self {
                    error_code: String::new(),
                    message,
                    http_status: status,
                    context: Value::String(text),
                    retry_after_seconds: None,
                };
                if classify(&envelope) == ErrorKind::RateLimit {
                    envelope.retry_after_seconds = retry_after;
                }
                envelope
            }
        }
    }

    /// True when the body carried neither an `errors` list nor a
    /// `responseMessage`, i.e. the vendor gave us nothing typed.
    fn is_untyped(&self) -> bool {
        self.error_code.is_empty()
            && !self
                .context
                .as_object()
                .map(|o| o.contains_key("errors") || o.contains_key("responseMessage"))
                .unwrap_or(false)
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        match (self.error_code.is_empty(), self.http_status) {
            (false, Some(status)) => write!(f, " ({}, HTTP {})", self.error_code, status),
            (false, None) => write!(f, " ({})", self.error_code),
            (true, Some(status)) => write!(f, " (HTTP {})", status),
            (true, None) => Ok(()),
        }
    }
}

/// Tag for each member of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    Configuration,
    SessionExpired,
    QuerySyntax,
    FieldNotFound,
    InvalidState,
    Authorization,
    Validation,
    RateLimit,
    GenericApi,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Authentication => "authentication error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::SessionExpired => "session expired",
            ErrorKind::QuerySyntax => "query syntax error",
            ErrorKind::FieldNotFound => "field not found",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Authorization => "not authorized",
            ErrorKind::Validation => "validation error",
            ErrorKind::RateLimit => "rate limited",
            ErrorKind::GenericApi => "API error",
            ErrorKind::Transport => "transport error",
        };
        f.write_str(name)
    }
}

/// Map a vendor error envelope onto exactly one error kind. Never fails.
pub fn classify(envelope: &ErrorEnvelope) -> ErrorKind {
    match envelope.error_code.as_str() {
        "INVALID_SESSION_ID" => ErrorKind::SessionExpired,
        "MALFORMED_URL" => ErrorKind::QuerySyntax,
        "ATTRIBUTE_NOT_SUPPORTED" => ErrorKind::FieldNotFound,
        "OPERATION_NOT_ALLOWED" => ErrorKind::InvalidState,
        "NO_PERMISSION" => ErrorKind::Authorization,
        "INVALID_DATA" => ErrorKind::Validation,
        "RATE_LIMIT_EXCEEDED" => ErrorKind::RateLimit,
        "" if envelope.is_untyped() => match envelope.http_status {
            Some(401) => ErrorKind::SessionExpired,
            Some(403) => ErrorKind::Authorization,
            Some(429) => ErrorKind::RateLimit,
            _ => ErrorKind::GenericApi,
        },
        _ => ErrorKind::GenericApi,
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session expired: {0}")]
    SessionExpired(ErrorEnvelope),

    #[error("Query syntax error: {0}")]
    QuerySyntax(ErrorEnvelope),

    #[error("Field not found: {0}")]
    FieldNotFound(ErrorEnvelope),

    #[error("Invalid state: {0}")]
    InvalidState(ErrorEnvelope),

    #[error("Not authorized: {0}")]
    Authorization(ErrorEnvelope),

    #[error("Validation error: {0}")]
    Validation(ErrorEnvelope),

    #[error("Rate limited: {0}")]
    RateLimit(ErrorEnvelope),

    #[error("API error: {0}")]
    GenericApi(ErrorEnvelope),

    #[error("Transport error: {message}")]
    Transport { message: String, timed_out: bool },
}

impl VaultError {
    /// Build the typed error for an envelope via [`classify`].
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        match classify(&envelope) {
            ErrorKind::SessionExpired => VaultError::SessionExpired(envelope),
            ErrorKind::QuerySyntax => VaultError::QuerySyntax(envelope),
            ErrorKind::FieldNotFound => VaultError::FieldNotFound(envelope),
            ErrorKind::InvalidState => VaultError::InvalidState(envelope),
            ErrorKind::Authorization => VaultError::Authorization(envelope),
            ErrorKind::Validation => VaultError::Validation(envelope),
            ErrorKind::RateLimit => VaultError::RateLimit(envelope),
            _ => VaultError::GenericApi(envelope),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        VaultError::Transport {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Authentication(_) => ErrorKind::Authentication,
            VaultError::Configuration(_) => ErrorKind::Configuration,
            VaultError::SessionExpired(_) => ErrorKind::SessionExpired,
            VaultError::QuerySyntax(_) => ErrorKind::QuerySyntax,
            VaultError::FieldNotFound(_) => ErrorKind::FieldNotFound,
            VaultError::InvalidState(_) => ErrorKind::InvalidState,
            VaultError::Authorization(_) => ErrorKind::Authorization,
            VaultError::Validation(_) => ErrorKind::Validation,
            VaultError::RateLimit(_) => ErrorKind::RateLimit,
            VaultError::GenericApi(_) => ErrorKind::GenericApi,
            VaultError::Transport { .. } => ErrorKind::Transport,
        }
    }

    /// The vendor payload behind an API-level error, if any.
    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            VaultError::SessionExpired(e)
            | VaultError::QuerySyntax(e)
            | VaultError::FieldNotFound(e)
            | VaultError::InvalidState(e)
            | VaultError::Authorization(e)
            | VaultError::Validation(e)
            | VaultError::RateLimit(e)
            | VaultError::GenericApi(e) => Some(e),
            _ => None,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            VaultError::RateLimit(e) => e.retry_after_seconds,
            _ => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        self.envelope().and_then(|e| e.http_status)
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, VaultError::SessionExpired(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, VaultError::Transport { timed_out: true, .. })
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        VaultError::Transport {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
