//! Auth capability port
//!
//! The OAuth2 subsystem is an external collaborator: the core only needs a
//! bearer token for each request and a way to force a refresh after a 401.

use crate::domain::CoreError;

/// Provider of bearer tokens for the remote API
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a bearer token expected to be valid now. Implementations may
    /// refresh transparently when the cached token is near expiry.
    async fn bearer(&self) -> Result<String, CoreError>;

    /// Forces a refresh (the remote rejected the current token) and returns
    /// the new bearer token.
    async fn refresh(&self) -> Result<String, CoreError>;
}

/// Fixed-token source for tests and short-lived tooling.
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn bearer(&self) -> Result<String, CoreError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, CoreError> {
        Err(CoreError::AuthExpired)
    }
}
