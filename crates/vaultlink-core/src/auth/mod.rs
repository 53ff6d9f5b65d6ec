//! Authentication and session lifecycle.
//!
//! This module provides:
//! - `AuthManager`: owns the current session and renews it before expiry
//! - `Session`: an authenticated Vault session with optional expiry
//! - `SessionStore`: on-disk persistence of the current session
//! - `CredentialStore`: OS keychain storage for service-account passwords
//!
//! Password sessions are refreshed through Vault's keep-alive endpoint;
//! OAuth sessions expire with the access token they were exchanged for.

pub mod credentials;
pub mod manager;
pub mod oauth;
pub mod session;

pub use credentials::{CredentialStore, Credentials, OAuthCredentials, PasswordCredentials};
pub use manager::{AuthManager, AuthState, KeepAliveHandle, CLIENT_ID_HEADER};
pub use oauth::{AccessToken, ClientCredentials, StaticToken, TokenSource};
pub use session::{Session, SessionError, SessionStore};
