use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::VaultClient;

use super::protocol::{
    McpError, McpRequest, McpResponse, ToolResult, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use super::tools::{ToolError, ToolRegistry};

const SERVER_NAME: &str = "vaultlink";

/// MCP server exposing Vault tools over one shared [`VaultClient`].
pub struct McpServer {
    client: VaultClient,
    tools: ToolRegistry,
}

impl McpServer {
    pub fn new(client: VaultClient) -> Self {
        Self::with_tools(client, ToolRegistry::vault_tools())
    }

    pub fn with_tools(client: VaultClient, tools: ToolRegistry) -> Self {
        Self { client, tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Handle one request. Notifications produce no response.
    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        let Some(id) = request.id.clone() else {
            debug!(method = %request.method, "Notification received");
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(McpResponse::error(
                id,
                McpError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }

        let response = match request.method.as_str() {
            "initialize" => McpResponse::success(id, self.initialize_result()),
            "ping" => McpResponse::success(id, json!({})),
            "tools/list" => McpResponse::success(id, json!({ "tools": self.tools.definitions() })),
            "tools/call" => match self.call_tool(&request.params).await {
                Ok(result) => McpResponse::success(id, serialize_result(&result)),
                Err(error) => McpResponse::error(id, error),
            },
            other => McpResponse::error(
                id,
                McpError::new(METHOD_NOT_FOUND, format!("method not found: {}", other)),
            ),
        };
        Some(response)
    }

    /// Handle one line of the stdio transport and return the reply line.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<McpRequest>(line) {
            Ok(request) => self.handle_request(request).await?,
            Err(e) => {
                warn!(error = %e, "Unparseable MCP message");
                McpResponse::error(Value::Null, McpError::new(PARSE_ERROR, format!("parse error: {}", e)))
            }
        };
        match serde_json::to_string(&response) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "Failed to serialize MCP response");
                None
            }
        }
    }

    /// Serve line-delimited JSON-RPC until `reader` reaches EOF or writing
    /// to `writer` fails.
    ///
    /// Requests are handled concurrently, so replies may be written out of
    /// order; clients match them by `id`.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(tools = self.tools.len(), "MCP server listening on stdio");

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut handlers = JoinSet::new();
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = tx.closed() => {
                    warn!("MCP output closed, no longer reading requests");
                    handlers.abort_all();
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };

            while let Some(finished) = handlers.try_join_next() {
                if let Err(e) = finished {
                    warn!(error = %e, "MCP request handler failed");
                }
            }

            if line.trim().is_empty() {
                continue;
            }
            let server = Arc::clone(&self);
            let tx = tx.clone();
            handlers.spawn(async move {
                if let Some(reply) = server.handle_line(&line).await {
                    if tx.send(reply).is_err() {
                        debug!("Dropping MCP reply, output is closed");
                    }
                }
            });
        }

        while handlers.join_next().await.is_some() {}
        drop(tx);
        writer_task.await??;

        info!("MCP client closed the connection");
        Ok(())
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        })
    }

    async fn call_tool(&self, params: &Value) -> std::result::Result<ToolResult, McpError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::new(INVALID_PARAMS, "tools/call requires a tool name"))?;
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| McpError::new(INVALID_PARAMS, format!("unknown tool: {}", name)))?;

        let args = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        debug!(tool = name, "Calling tool");
        match tool.execute(args, &self.client).await {
            Ok(result) => Ok(result),
            Err(ToolError::Vault(e)) => {
                warn!(tool = name, kind = ?e.kind(), error = %e, "Tool call failed");
                Ok(ToolResult::error(e.to_string()))
            }
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

fn serialize_result(result: &ToolResult) -> Value {
    serde_json::to_value(result).unwrap_or_else(|e| {
        serde_json::to_value(ToolResult::error(format!("failed to encode tool result: {}", e)))
            .unwrap_or(Value::Null)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::Config;

    fn server() -> McpServer {
        let config = Config::new("myvault.veevavault.com", Credentials::password("u", "p")).unwrap();
        McpServer::new(VaultClient::from_config(config).unwrap())
    }

    fn request(value: Value) -> McpRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let response = server()
            .handle_request(request(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "vaultlink");
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = server()
            .handle_request(request(json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"})))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 4);
    }

    #[tokio::test]
    async fn test_notification_gets_no_reply() {
        let response = server()
            .handle_request(request(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = server()
            .handle_request(request(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let response = server()
            .handle_request(request(json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "vault_drop_tables", "arguments": {}}
            })))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_tool_errors() {
        let response = server()
            .handle_request(request(json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "vault_query", "arguments": {}}
            })))
            .await
            .unwrap();
        let result: ToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.text_content().contains("query"));
    }

    #[tokio::test]
    async fn test_parse_error_line() {
        let line = server().handle_line("{not json").await.unwrap();
        let response: McpResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id, Value::Null);
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }
}
