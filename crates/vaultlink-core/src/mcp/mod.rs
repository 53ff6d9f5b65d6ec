//! MCP (Model Context Protocol) server exposing a few Vault calls as tools.
//!
//! Supported methods: `initialize`, `ping`, `tools/list`, `tools/call`.
//! Notifications are accepted and never answered. Tool failures come back
//! as results with `isError: true` carrying one human-readable message.

pub mod protocol;
pub mod server;
pub mod tools;

pub use protocol::{ContentBlock, McpError, McpRequest, McpResponse, ToolDefinition, ToolResult};
pub use server::McpServer;
pub use tools::{Tool, ToolError, ToolRegistry};
