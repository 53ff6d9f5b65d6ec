//! Vault REST API plumbing.
//!
//! This module provides the `VaultClient` dispatcher every resource call goes
//! through, the `Transport` seam it sends requests over, and the error
//! taxonomy Vault failures are classified into.
//!
//! Vault reports failures both as HTTP errors and as `responseStatus`
//! values inside an HTTP 200; both are surfaced as [`VaultError`].

pub mod client;
pub mod error;
pub mod response;
pub mod transport;

pub use client::{ApiRequest, VaultClient};
pub use error::{classify, ErrorEnvelope, ErrorKind, Result, VaultError};
pub use response::{ParsedResult, RawResponse, ResponseFormat, ResponseStatus, VaultResponse};
pub use reqwest::Method;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, RequestBody, Transport};
