//! Vault calls exposed to agents as MCP tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

use crate::api::{VaultClient, VaultError};

use super::protocol::{ToolDefinition, ToolResult};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: Value, client: &VaultClient) -> Result<ToolResult, ToolError>;
}

/// Tools by name, in a stable order for `tools/list`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Vault tool set.
    pub fn vault_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(QueryTool));
        registry.register(Arc::new(GetDocumentTool));
        registry.register(Arc::new(GetObjectRecordTool));
        registry.register(Arc::new(SessionInfoTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn string_arg(args: &Value, name: &str) -> Result<String, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be a non-empty string", name)))
}

/// Accepts a JSON integer or a numeric string; agents send both.
fn id_arg(args: &Value, name: &str) -> Result<i64, ToolError> {
    match args.get(name) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be an integer id", name)))
}

pub struct QueryTool;

#[async_trait]
impl Tool for QueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "vault_query",
            "Run a VQL query against Vault and return the matching records.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "VQL statement, e.g. SELECT id, name__v FROM documents"
                    }
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, args: Value, client: &VaultClient) -> Result<ToolResult, ToolError> {
        let vql = string_arg(&args, "query")?;
        let response = client.with_session_retry(|| client.query(&vql)).await?;
        Ok(ToolResult::json(&response.into_json()))
    }
}

pub struct GetDocumentTool;

#[async_trait]
impl Tool for GetDocumentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "vault_get_document",
            "Retrieve the metadata of the latest version of a Vault document.",
            json!({
                "type": "object",
                "properties": {
                    "document_id": {"type": "integer", "description": "Document id"}
                },
                "required": ["document_id"]
            }),
        )
    }

    async fn execute(&self, args: Value, client: &VaultClient) -> Result<ToolResult, ToolError> {
        let doc_id = id_arg(&args, "document_id")?;
        let response = client
            .with_session_retry(|| client.retrieve_document(doc_id))
            .await?;
        Ok(ToolResult::json(&response.into_json()))
    }
}

pub struct GetObjectRecordTool;

#[async_trait]
impl Tool for GetObjectRecordTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "vault_get_object_record",
            "Retrieve one record of a Vault object, e.g. product__v.",
            json!({
                "type": "object",
                "properties": {
                    "object_name": {"type": "string", "description": "Object API name"},
                    "record_id": {"type": "string", "description": "Record id"}
                },
                "required": ["object_name", "record_id"]
            }),
        )
    }

    async fn execute(&self, args: Value, client: &VaultClient) -> Result<ToolResult, ToolError> {
        let object_name = string_arg(&args, "object_name")?;
        let record_id = string_arg(&args, "record_id")?;
        let response = client
            .with_session_retry(|| client.retrieve_object_record(&object_name, &record_id))
            .await?;
        Ok(ToolResult::json(&response.into_json()))
    }
}

pub struct SessionInfoTool;

#[async_trait]
impl Tool for SessionInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "vault_session_info",
            "Show which user and vault the server is connected as.",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn execute(&self, _args: Value, client: &VaultClient) -> Result<ToolResult, ToolError> {
        let session = client.auth().get_session().await?;

        let mut info = session.to_dict();
        info.remove("session_id");
        info.insert("vault_url".into(), Value::String(client.config().base_url.clone()));
        info.insert(
            "minutes_until_expiry".into(),
            session
                .minutes_until_expiry(Utc::now())
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        Ok(ToolResult::json(&Value::Object(info)))
    }
}
