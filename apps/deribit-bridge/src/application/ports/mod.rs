//! Port Interfaces
//!
//! Contracts between the router and the infrastructure adapters.
//!
//! ## Driver Ports (Inbound)
//!
//! - `ConnectorHandler`: events raised by the upstream connection
//! - `BrokerHandler`: events raised by local client sessions
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamPort`: send control messages to the exchange
//! - `SessionDirectory`: look up and write to local sessions
//! - `RpcTransport`: one-shot JSON-over-HTTP calls to the trading API
//!
//! Handlers run on the reader task that raised the event. They must not
//! block for long, since the next frame is not read until they return.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::subscription::SessionId;

// =============================================================================
// Inbound Handlers
// =============================================================================

/// Receives upstream connection events.
#[async_trait]
pub trait ConnectorHandler: Send + Sync {
    /// Connection established and the reader is running.
    async fn on_open(&self);

    /// One whole inbound text frame.
    async fn on_message(&self, text: &str);

    /// Connection closed, by either side.
    async fn on_close(&self);

    /// Transport failure. Orderly-shutdown noise is never reported here.
    async fn on_error(&self, message: &str);
}

/// Receives local session events.
#[async_trait]
pub trait BrokerHandler: Send + Sync {
    /// Session accepted and registered.
    async fn on_connect(&self, session: SessionId);

    /// One inbound text frame from a session.
    async fn on_message(&self, session: SessionId, text: &str);

    /// Session closed and removed from the registry.
    async fn on_disconnect(&self, session: SessionId);

    /// Read failure on a session.
    async fn on_error(&self, session: SessionId, message: &str);
}

// =============================================================================
// Outbound Ports
// =============================================================================

/// Errors sending to the exchange connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// No open connection.
    #[error("upstream not connected")]
    NotConnected,

    /// Write failed.
    #[error("upstream send failed: {0}")]
    SendFailed(String),
}

/// Outbound side of the exchange connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamPort: Send + Sync {
    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Write one text frame.
    async fn send_text(&self, text: &str) -> Result<(), UpstreamError>;
}

/// Registry of live local sessions.
#[cfg_attr(test, mockall::automock)]
pub trait SessionDirectory: Send + Sync {
    /// Whether the session is still registered.
    fn is_live(&self, session: SessionId) -> bool;

    /// Queue a payload for the session. Returns `false` if it is gone.
    fn deliver(&self, session: SessionId, payload: &str) -> bool;

    /// Number of live sessions.
    fn live_count(&self) -> usize;
}

/// Errors from the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Request could not be sent or the response not read.
    #[error("request failed: {0}")]
    Request(String),

    /// Non-success status with a body that is not JSON.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// Success status with a body that is not JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// One-shot JSON POST against the trading API.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// POST `body` to `path` (relative to the API base URL), optionally with
    /// a bearer token, and return the decoded JSON response.
    ///
    /// JSON error bodies are returned as `Ok` so callers can read the
    /// JSON-RPC `error` object.
    async fn post(
        &self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<Value, TransportError>;
}
