//! Token acquisition for authenticated connections.
//!
//! When the client has a [`TokenProvider`], every connection attempt first
//! acquires a token and appends it to the URL as the `token` query
//! parameter. Failing to acquire one aborts the attempt: the client emits
//! an `error` event, settles at `CLOSED`, and waits for the next explicit
//! `connect()`.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use url::Url;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Query parameter carrying the token.
pub const TOKEN_QUERY_PARAM: &str = "token";

// ============================================================================
// TokenProvider
// ============================================================================

/// Supplies tokens for connection attempts.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Acquires a token for the next connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`](crate::Error::Auth) if no token is available.
    async fn acquire_token(&self) -> Result<String>;
}

// ============================================================================
// StaticToken
// ============================================================================

/// Provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Creates a provider for a fixed token.
    #[inline]
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn acquire_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns `url` with the `token` parameter set, replacing any previous one.
#[must_use]
pub fn authorized_url(url: &Url, token: &str) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_QUERY_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut authorized = url.clone();
    authorized
        .query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(TOKEN_QUERY_PARAM, token);
    authorized
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;

    struct Failing;

    #[async_trait]
    impl TokenProvider for Failing {
        async fn acquire_token(&self) -> Result<String> {
            Err(Error::auth("token endpoint returned 401"))
        }
    }

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticToken::new("abc123");
        assert_eq!(provider.acquire_token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let provider: Box<dyn TokenProvider> = Box::new(Failing);
        let err = provider.acquire_token().await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn test_authorized_url_appends_token() {
        let url = Url::parse("wss://api.example.com/ws").unwrap();
        assert_eq!(
            authorized_url(&url, "abc").as_str(),
            "wss://api.example.com/ws?token=abc"
        );
    }

    #[test]
    fn test_authorized_url_keeps_other_params_and_replaces_token() {
        let url = Url::parse("ws://host/ws?room=7&token=old").unwrap();
        assert_eq!(
            authorized_url(&url, "new value").as_str(),
            "ws://host/ws?room=7&token=new+value"
        );
    }
}
