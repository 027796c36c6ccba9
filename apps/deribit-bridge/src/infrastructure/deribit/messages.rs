//! Deribit JSON-RPC Message Types
//!
//! Wire format types for the exchange's JSON-RPC 2.0 API, shared by the
//! WebSocket connector (subscriptions) and the HTTP pipeline (trading).
//!
//! # Envelopes
//!
//! Outbound:
//! ```json
//! {"jsonrpc":"2.0","id":7,"method":"public/subscribe","params":{"channels":["book.BTC-PERPETUAL.100ms"]}}
//! ```
//!
//! Inbound acknowledgment:
//! ```json
//! {"jsonrpc":"2.0","id":7,"result":["book.BTC-PERPETUAL.100ms"]}
//! ```
//!
//! Inbound event:
//! ```json
//! {"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.100ms","data":{...}}}
//! ```
//!
//! # References
//!
//! - [JSON-RPC](https://docs.deribit.com/#json-rpc)
//! - [Authentication](https://docs.deribit.com/#public-auth)

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Outbound
// =============================================================================

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<P> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Request identifier echoed in the response.
    pub id: u64,
    /// API method, e.g. `private/buy`.
    pub method: String,
    /// Method parameters.
    pub params: P,
}

impl<P: Serialize> RpcRequest<P> {
    /// Build a request envelope.
    pub fn new(id: u64, method: impl Into<String>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters fail to serialize.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Subscription visibility. Private channels need an authenticated socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeScope {
    /// Market data channels.
    Public,
    /// Account channels.
    Private,
}

impl SubscribeScope {
    /// Subscribe method for this scope.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Public => "public/subscribe",
            Self::Private => "private/subscribe",
        }
    }
}

/// `params` of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelsParams {
    /// Channels to subscribe to.
    pub channels: Vec<String>,
}

/// Build a subscribe request for the given channels.
#[must_use]
pub fn subscribe_request(
    scope: SubscribeScope,
    id: u64,
    channels: Vec<String>,
) -> RpcRequest<ChannelsParams> {
    RpcRequest::new(id, scope.method(), ChannelsParams { channels })
}

/// `params` of `public/auth` with the client-credentials grant.
#[derive(Clone, Serialize)]
pub struct AuthParams<'a> {
    /// Always `client_credentials`.
    pub grant_type: &'static str,
    /// API key.
    pub client_id: &'a str,
    /// API secret.
    pub client_secret: &'a str,
}

impl<'a> AuthParams<'a> {
    /// Client-credentials grant.
    #[must_use]
    pub const fn client_credentials(client_id: &'a str, client_secret: &'a str) -> Self {
        Self {
            grant_type: "client_credentials",
            client_id,
            client_secret,
        }
    }
}

impl fmt::Debug for AuthParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthParams")
            .field("grant_type", &self.grant_type)
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// `result` of a successful `public/auth`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthResult {
    /// Bearer token.
    pub access_token: String,
    /// Token for `refresh_token` grants.
    #[serde(default)]
    pub refresh_token: String,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: i64,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
}

/// JSON-RPC `error` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Exchange error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl RpcError {
    /// Read an `error` value leniently. Missing fields fall back to the raw
    /// JSON so nothing the exchange said is lost.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), ToString::to_string);
        Self { code, message }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

// =============================================================================
// Tests
// =============================================================================
