//! Deribit API Authentication
//!
//! Client-credentials authentication for the trading API and the token
//! state the pipeline worker keeps between requests.
//!
//! # Authentication Flow
//!
//! 1. POST `public/auth` with `grant_type=client_credentials`
//! 2. Receive `access_token`, `refresh_token`, `expires_in`
//! 3. Send `Authorization: Bearer <access_token>` on every request
//! 4. Re-authenticate once less than [`REFRESH_MARGIN_SECS`] of the
//!    token's lifetime remains
//!
//! # References
//!
//! - [public/auth](https://docs.deribit.com/#public-auth)

use std::fmt;

use thiserror::Error;
use tokio::time::Instant;

use super::messages::AuthResult;

// =============================================================================
// Constants
// =============================================================================

/// Re-authenticate when the token has less than this many seconds left.
pub const REFRESH_MARGIN_SECS: i64 = 60;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// API key or secret is empty.
    #[error("missing credentials: {0} is empty")]
    MissingCredentials(&'static str),

    /// The exchange did not return a `result`.
    #[error("authentication failed: {0}")]
    Rejected(String),

    /// The auth request itself failed.
    #[error("authentication request failed: {0}")]
    Transport(String),
}

// =============================================================================
// Credentials
// =============================================================================

/// Deribit API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingCredentials` if either value is empty.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        let api_secret = api_secret.into();

        if api_key.is_empty() {
            return Err(AuthError::MissingCredentials("api_key"));
        }
        if api_secret.is_empty() {
            return Err(AuthError::MissingCredentials("api_secret"));
        }

        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Token State
// =============================================================================

/// Session token and when it was obtained.
///
/// Owned by the pipeline worker; nothing else reads or writes it.
#[derive(Clone)]
pub struct TokenState {
    access_token: String,
    expires_in: i64,
    authenticated_at: Instant,
}

impl TokenState {
    /// Token obtained at `now`.
    #[must_use]
    pub fn from_result(result: AuthResult, now: Instant) -> Self {
        Self {
            access_token: result.access_token,
            expires_in: result.expires_in,
            authenticated_at: now,
        }
    }

    /// Bearer token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Token lifetime in seconds.
    #[must_use]
    pub const fn expires_in(&self) -> i64 {
        self.expires_in
    }

    /// Whether whole seconds elapsed since authentication exceed the
    /// lifetime minus the refresh margin.
    #[must_use]
    pub fn needs_refresh(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.authenticated_at).as_secs();
        let elapsed = i64::try_from(elapsed).unwrap_or(i64::MAX);
        elapsed > self.expires_in.saturating_sub(REFRESH_MARGIN_SECS)
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("authenticated_at", &self.authenticated_at)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
