//! Opaque authorization adapter.
//!
//! The client transport only knows how to attach a bearer token and how to
//! ask the provider to (re)authorize; token storage, refresh and the OAuth
//! redirect dance live behind this trait.

use async_trait::async_trait;

/// Tokens currently held by the provider.
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Outcome of an authorization attempt. Anything other than `Authorized`
/// leaves the transport unauthorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// A valid token is now available via `tokens()`.
    Authorized,
    /// The provider started a user-agent redirect; the application must
    /// capture the authorization code and call
    /// [`finish_auth`](crate::transport::StreamableHttpClientTransport::finish_auth).
    Redirect,
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Current tokens, if any.
    async fn tokens(&self) -> Option<OAuthTokens>;

    /// Run the authorization flow against `server_url`, completing a pending
    /// redirect when `authorization_code` is supplied.
    async fn authorize(
        &self,
        server_url: &str,
        authorization_code: Option<&str>,
    ) -> AuthorizationOutcome;
}
