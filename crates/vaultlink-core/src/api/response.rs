//! Typed views of the Vault JSON response envelope.
//!
//! Every Vault response carries a `responseStatus`. Successful responses
//! either hold data or, for asynchronous operations, a job id. Failures are
//! never represented here; the dispatcher turns them into [`VaultError`]s.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ErrorEnvelope, Result, VaultError};
use super::transport::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Warning,
    Failure,
    #[serde(other)]
    Unknown,
}

/// Successful Vault response.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultResponse {
    /// Plain success. `fields` holds everything except `responseStatus`.
    Data { fields: Map<String, Value> },
    /// Success that started an asynchronous job.
    Job {
        job_id: i64,
        url: Option<String>,
        fields: Map<String, Value>,
    },
}

impl VaultResponse {
    /// Interpret a parsed body. Any `responseStatus` other than `SUCCESS`,
    /// including one embedded in an HTTP 200, is an error.
    pub fn from_json(status: u16, body: Value) -> Result<Self> {
        let Value::Object(mut fields) = body else {
            return Err(VaultError::GenericApi(
                ErrorEnvelope::new("", "expected a JSON object response")
                    .with_status(status)
                    .with_context(body),
            ));
        };

        let response_status = fields
            .get("responseStatus")
            .cloned()
            .and_then(|v| serde_json::from_value::<ResponseStatus>(v).ok());

        if response_status != Some(ResponseStatus::Success) {
            let body = Value::Object(fields);
            return Err(VaultError::from_envelope(ErrorEnvelope::from_json(
                Some(status),
                &body,
                None,
            )));
        }

        fields.remove("responseStatus");

        match fields.get("job_id").and_then(Value::as_i64) {
            Some(job_id) => {
                let url = fields.get("url").and_then(Value::as_str).map(String::from);
                Ok(VaultResponse::Job {
                    job_id,
                    url,
                    fields,
                })
            }
            None => Ok(VaultResponse::Data { fields }),
        }
    }

    /// Interpret a transport response: HTTP failures and soft failures in
    /// a 2xx body both become classified errors.
    pub fn from_http(response: &HttpResponse) -> Result<Self> {
        if !response.is_success() {
            return Err(VaultError::from_envelope(ErrorEnvelope::from_body(
                Some(response.status),
                &response.body,
                response.retry_after(),
            )));
        }

        let body: Value = serde_json::from_slice(&response.body).map_err(|e| {
            VaultError::GenericApi(
                ErrorEnvelope::new("", format!("invalid JSON response: {}", e))
                    .with_status(response.status),
            )
        })?;
        Self::from_json(response.status, body)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        match self {
            VaultResponse::Data { fields } | VaultResponse::Job { fields, .. } => fields,
        }
    }

    /// The `data` member most endpoints wrap their payload in.
    pub fn data(&self) -> Option<&Value> {
        self.fields().get("data")
    }

    pub fn job_id(&self) -> Option<i64> {
        match self {
            VaultResponse::Job { job_id, .. } => Some(*job_id),
            VaultResponse::Data { .. } => None,
        }
    }

    /// Rebuild the JSON object as the server sent it.
    pub fn into_json(self) -> Value {
        let mut fields = match self {
            VaultResponse::Data { fields } | VaultResponse::Job { fields, .. } => fields,
        };
        fields.insert(
            "responseStatus".to_string(),
            Value::String("SUCCESS".to_string()),
        );
        Value::Object(fields)
    }

    /// Deserialize the whole response into a caller type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields().clone())).map_err(|e| {
            VaultError::GenericApi(ErrorEnvelope::new(
                "",
                format!("failed to parse response: {}", e),
            ))
        })
    }
}

/// Unparsed response for binary endpoints such as file downloads.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub body: Bytes,
}

/// Result of a dispatcher call, shaped by the caller's requested format.
#[derive(Debug, Clone)]
pub enum ParsedResult {
    Json(VaultResponse),
    Raw(RawResponse),
}

/// What the caller wants back from the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Raw,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_with_data() {
        let body = json!({"responseStatus": "SUCCESS", "data": [{"id": 1}], "responseDetails": {"size": 1}});
        let resp = VaultResponse::from_json(200, body).unwrap();
        assert_eq!(resp.data(), Some(&json!([{"id": 1}])));
        assert_eq!(resp.job_id(), None);
        assert!(resp.fields().contains_key("responseDetails"));
    }

    #[test]
    fn test_success_with_job() {
        let body = json!({"responseStatus": "SUCCESS", "job_id": 4021, "url": "/api/v25.1/services/jobs/4021"});
        let resp = VaultResponse::from_json(200, body).unwrap();
        assert_eq!(resp.job_id(), Some(4021));
        match resp {
            VaultResponse::Job { url, .. } => {
                assert_eq!(url.as_deref(), Some("/api/v25.1/services/jobs/4021"))
            }
            other => panic!("expected job response, got {:?}", other),
        }
    }

    #[test]
    fn test_soft_failure_invalid_session() {
        let body = json!({
            "responseStatus": "FAILURE",
            "errors": [{"type": "INVALID_SESSION_ID", "message": "Session expired"}]
        });
        let err = VaultResponse::from_json(200, body).unwrap_err();
        assert!(err.is_session_expired());
        assert_eq!(err.http_status(), Some(200));
    }

    #[test]
    fn test_missing_status_is_failure() {
        let err = VaultResponse::from_json(200, json!({"data": []})).unwrap_err();
        assert!(matches!(err, VaultError::GenericApi(_)));
    }

    #[test]
    fn test_warning_is_not_success() {
        let body = json!({"responseStatus": "WARNING", "responseMessage": "Partial"});
        let err = VaultResponse::from_json(200, body).unwrap_err();
        assert_eq!(err.envelope().map(|e| e.message.as_str()), Some("Partial"));
    }

    fn http(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: reqwest::header::HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_from_http_hard_failure_classified() {
        let body = r#"{"responseStatus":"FAILURE","errors":[{"type":"NO_PERMISSION","message":"denied"}]}"#;
        let err = VaultResponse::from_http(&http(403, body)).unwrap_err();
        assert!(matches!(err, VaultError::Authorization(_)));

        let err = VaultResponse::from_http(&http(503, "upstream down")).unwrap_err();
        assert!(matches!(err, VaultError::GenericApi(ref e) if e.http_status == Some(503)));
    }

    #[test]
    fn test_from_http_invalid_json() {
        let err = VaultResponse::from_http(&http(200, "<html>")).unwrap_err();
        assert!(matches!(err, VaultError::GenericApi(_)));
    }

    #[test]
    fn test_into_json_restores_status() {
        let body = json!({"responseStatus": "SUCCESS", "data": {"name__v": "x"}});
        let resp = VaultResponse::from_json(200, body.clone()).unwrap();
        assert_eq!(resp.into_json(), body);
    }
}
