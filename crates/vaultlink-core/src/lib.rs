//! vaultlink core: a Veeva Vault REST client built around one session
//! lifecycle manager.
//!
//! - [`auth::AuthManager`] acquires, renews and discards sessions. Concurrent
//!   callers share a single in-flight authentication.
//! - [`api::VaultClient`] is the generic call path every resource request
//!   goes through. It attaches the session and classifies Vault failures.
//! - [`mcp::McpServer`] exposes a handful of Vault calls as MCP tools.

pub mod api;
pub mod auth;
pub mod config;
pub mod mcp;

pub use api::{ApiRequest, ErrorEnvelope, ErrorKind, Result, VaultClient, VaultError, VaultResponse};
pub use auth::{AuthManager, Credentials, Session};
pub use config::Config;
