//! Upstream WebSocket Connector
//!
//! Single duplex connection to the exchange's WebSocket API.
//!
//! # State Machine
//!
//! ```text
//! Idle ──connect──► Connecting ──ok──► Open ──close()──► Closing ──► Closed
//!  ▲                    │                │
//!  └─ handshake err or ─┘                └── transport error / peer close ──► Closed
//!     timeout
//! ```
//!
//! `connect` may be called again from `Idle` or `Closed`. There is no
//! automatic reconnect.
//!
//! # Threads
//!
//! Frames are read on a dedicated task and handed whole to the
//! [`ConnectorHandler`]. Writes happen on the caller's task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectorHandler, UpstreamError, UpstreamPort};
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long `close` waits for the close handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on the opening handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Errors
// =============================================================================

/// Connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// `connect` called while a connection is active or in progress.
    #[error("already connected or connecting")]
    AlreadyConnected,

    /// TCP, TLS or WebSocket handshake failed.
    #[error("connection to {url} failed: {reason}")]
    ConnectFailed {
        /// Target URL.
        url: String,
        /// Underlying error.
        reason: String,
    },

    /// Handshake did not complete in time.
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target URL.
        url: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// No open connection.
    #[error("not connected")]
    NotConnected,

    /// Write failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Close handshake failed for a reason other than orderly shutdown.
    #[error("close failed: {0}")]
    CloseFailed(String),
}

impl From<ConnectorError> for UpstreamError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotConnected => Self::NotConnected,
            other => Self::SendFailed(other.to_string()),
        }
    }
}

/// Whether a WebSocket error is expected while a connection is being torn
/// down (peer already gone, truncated stream, cancelled I/O).
#[must_use]
pub fn is_shutdown_noise(err: &tokio_tungstenite::tungstenite::Error) -> bool {
    use std::io::ErrorKind;
    use tokio_tungstenite::tungstenite::Error;
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    match err {
        Error::ConnectionClosed
        | Error::AlreadyClosed
        | Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::Interrupted
        ),
        _ => false,
    }
}

// =============================================================================
// State
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorState {
    /// Never connected, or last attempt failed.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected and reading.
    Open,
    /// `close` in progress.
    Closing,
    /// Connection ended.
    Closed,
}

impl ConnectorState {
    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Result of [`Connector::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A close handshake was attempted.
    Closed,
    /// Nothing to close.
    AlreadyClosed,
}

struct Reader {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Connector
// =============================================================================

/// WebSocket client for the exchange.
pub struct Connector {
    secure: bool,
    connect_timeout: Duration,
    state: Arc<Mutex<ConnectorState>>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    reader: Mutex<Option<Reader>>,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector {
    /// Connector that speaks `wss://` with certificate verification against
    /// the bundled web PKI roots and SNI set to the host.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tls(true)
    }

    /// Connector that speaks plain `ws://`. For local peers only.
    #[must_use]
    pub fn plaintext() -> Self {
        Self::with_tls(false)
    }

    fn with_tls(secure: bool) -> Self {
        Self {
            secure,
            connect_timeout: CONNECT_TIMEOUT,
            state: Arc::new(Mutex::new(ConnectorState::Idle)),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }

    /// Bound the opening handshake by `timeout` instead of
    /// [`CONNECT_TIMEOUT`].
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        *self.state.lock()
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectorState::Open
    }

    /// URL for an endpoint.
    #[must_use]
    pub fn url(&self, host: &str, port: u16, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{scheme}://{host}:{port}{path}")
    }

    /// Connect and start the reader.
    ///
    /// On failure or timeout `handler.on_error` is called, the state
    /// returns to `Idle`, and no retry is made.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::AlreadyConnected` if a connection is active,
    /// `ConnectorError::ConnectFailed` if the handshake fails, or
    /// `ConnectorError::ConnectTimeout` if it does not finish in time.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        path: &str,
        handler: Arc<dyn ConnectorHandler>,
    ) -> Result<(), ConnectorError> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, ConnectorState::Idle | ConnectorState::Closed) {
                return Err(ConnectorError::AlreadyConnected);
            }
            *state = ConnectorState::Connecting;
        }

        let url = self.url(host, port, path);
        tracing::info!(url = %url, "Connecting to exchange");

        let attempt =
            tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await;
        let stream = match attempt {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                let err = ConnectorError::ConnectFailed {
                    url,
                    reason: e.to_string(),
                };
                return Err(self.abort_connect(err, handler.as_ref()).await);
            }
            Err(_) => {
                let err = ConnectorError::ConnectTimeout {
                    url,
                    timeout: self.connect_timeout,
                };
                return Err(self.abort_connect(err, handler.as_ref()).await);
            }
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.state.lock() = ConnectorState::Open;
        metrics::set_upstream_connected(true);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            source,
            handler,
            cancel.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.sink),
        ));
        *self.reader.lock() = Some(Reader { cancel, handle });

        tracing::info!(url = %url, "Exchange connection open");
        Ok(())
    }

    async fn abort_connect(
        &self,
        err: ConnectorError,
        handler: &dyn ConnectorHandler,
    ) -> ConnectorError {
        *self.state.lock() = ConnectorState::Idle;
        tracing::error!(error = %err, "Upstream connect failed");
        handler.on_error(&err.to_string()).await;
        err
    }

    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::NotConnected` when the connection is not
    /// open, or `ConnectorError::SendFailed` if the write fails.
    pub async fn send_message(&self, text: &str) -> Result<(), ConnectorError> {
        if !self.is_open() {
            return Err(ConnectorError::NotConnected);
        }

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(ConnectorError::NotConnected);
        };

        sink.send(Message::text(text.to_string()))
            .await
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))
    }

    /// Stop the reader, then attempt a normal-closure handshake bounded by
    /// [`CLOSE_TIMEOUT`]. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::CloseFailed` for errors that are not
    /// orderly-shutdown noise.
    pub async fn close(&self) -> Result<CloseOutcome, ConnectorError> {
        {
            let mut state = self.state.lock();
            if *state != ConnectorState::Open {
                return Ok(CloseOutcome::AlreadyClosed);
            }
            *state = ConnectorState::Closing;
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.cancel.cancel();
            if let Err(e) = reader.handle.await {
                tracing::warn!(error = %e, "Upstream reader task failed");
            }
        }

        let sink = self.sink.lock().await.take();
        let result = match sink {
            Some(mut sink) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: String::new().into(),
                };
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame))))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) if is_shutdown_noise(&e) => {
                        tracing::debug!(error = %e, "Ignoring error during close");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(ConnectorError::CloseFailed(e.to_string())),
                    Err(_) => {
                        tracing::debug!("Close handshake timed out");
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        };

        *self.state.lock() = ConnectorState::Closed;
        metrics::set_upstream_connected(false);

        match result {
            Ok(()) => {
                tracing::info!("Exchange connection closed");
                Ok(CloseOutcome::Closed)
            }
            Err(e) => {
                tracing::error!(error = %e, "Exchange close failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl UpstreamPort for Connector {
    fn is_open(&self) -> bool {
        Self::is_open(self)
    }

    async fn send_text(&self, text: &str) -> Result<(), UpstreamError> {
        Ok(self.send_message(text).await?)
    }
}

// =============================================================================
// Reader
// =============================================================================

async fn read_loop(
    mut source: WsSource,
    handler: Arc<dyn ConnectorHandler>,
    cancel: CancellationToken,
    state: Arc<Mutex<ConnectorState>>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
) {
    handler.on_open().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Upstream reader stopped");
                break;
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_upstream_frame();
                        handler.on_message(text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_upstream_frame();
                        match std::str::from_utf8(&data) {
                            Ok(text) => handler.on_message(text).await,
                            Err(e) => tracing::warn!(error = %e, "Dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Exchange sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite.
                    }
                    Some(Err(e)) => {
                        if is_shutdown_noise(&e) {
                            tracing::debug!(error = %e, "Upstream stream ended");
                        } else {
                            tracing::error!(error = %e, "Upstream read failed");
                            handler.on_error(&e.to_string()).await;
                        }
                        break;
                    }
                    None => {
                        tracing::info!("Upstream stream ended");
                        break;
                    }
                }
            }
        }
    }

    // `close` owns teardown once it has started.
    let ended_by_peer = {
        let mut state = state.lock();
        if *state == ConnectorState::Open {
            *state = ConnectorState::Closed;
            true
        } else {
            false
        }
    };
    if ended_by_peer {
        sink.lock().await.take();
        metrics::set_upstream_connected(false);
    }

    handler.on_close().await;
}
