//! Local WebSocket broker.
//!
//! Accepts any number of client sessions. Each session gets a reader and a
//! writer task on the shared runtime; handler callbacks run on the reader.
//!
//! ## Session lifecycle
//!
//! 1. Handshake (frames capped at [`MAX_MESSAGE_SIZE`])
//! 2. Register under the registry lock, then `on_connect`
//! 3. Read frames, calling `on_message` for each, until the peer closes
//! 4. Unregister, then `on_disconnect`
//!
//! A read error that is not orderly-close noise is reported through
//! `on_error` and also ends the session. tungstenite streams cannot be read
//! again after an error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::SessionRegistry;
use super::session::{DEFAULT_SEND_QUEUE_CAPACITY, Session, WireFormat, write_loop};
use crate::application::ports::BrokerHandler;
use crate::domain::subscription::SessionId;
use crate::infrastructure::deribit::connector::is_shutdown_noise;

/// Largest accepted inbound message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How long `stop` waits for session tasks to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Address to listen on. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Frame type for outbound payloads.
    pub wire_format: WireFormat,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
    /// Frames queued per session before payloads are dropped.
    pub send_queue_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            wire_format: WireFormat::Text,
            max_message_size: MAX_MESSAGE_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Could not bind the listener.
    #[error("failed to bind {addr}: {reason}")]
    BindFailed {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        reason: String,
    },

    /// `run` called twice, or after `stop`.
    #[error("broker already started")]
    AlreadyStarted,
}

// =============================================================================
// Server
// =============================================================================

/// WebSocket server for local subscribers.
pub struct BrokerServer {
    settings: BrokerSettings,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    next_id: Arc<AtomicU64>,
    started: AtomicBool,
    stopped: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl BrokerServer {
    /// Create a broker. Nothing is bound until [`run`](Self::run).
    #[must_use]
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(SessionRegistry::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_id: Arc::new(AtomicU64::new(1)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Shared session registry.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bound address, once running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind and start accepting sessions in the background.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::BindFailed` if the address cannot be bound, or
    /// `BrokerError::AlreadyStarted` on a second call.
    pub async fn run(&self, handler: Arc<dyn BrokerHandler>) -> Result<SocketAddr, BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.settings.listen_addr)
            .await
            .map_err(|e| BrokerError::BindFailed {
                addr: self.settings.listen_addr,
                reason: e.to_string(),
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| BrokerError::BindFailed {
                addr: self.settings.listen_addr,
                reason: e.to_string(),
            })?;
        *self.local_addr.lock() = Some(addr);

        tracing::info!(
            addr = %addr,
            wire_format = ?self.settings.wire_format,
            "Broker listening"
        );

        let acceptor = Acceptor {
            registry: Arc::clone(&self.registry),
            handler,
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
            next_id: Arc::clone(&self.next_id),
            wire_format: self.settings.wire_format,
            max_message_size: self.settings.max_message_size,
            send_queue_capacity: self.settings.send_queue_capacity,
        };
        self.tracker.spawn(acceptor.accept_loop(listener));

        Ok(addr)
    }

    /// Queue a payload for every live session. Returns how many accepted it.
    pub fn broadcast(&self, payload: &str) -> usize {
        self.registry.broadcast(payload)
    }

    /// Stop accepting, close every session with a normal-closure frame,
    /// clear the registry and wait for all session tasks. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();

        let sessions = self.registry.drain();
        for session in &sessions {
            session.close();
        }
        let closed = sessions.len();
        drop(sessions);

        self.tracker.close();
        if tokio::time::timeout(STOP_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = STOP_TIMEOUT.as_secs(),
                "Broker tasks did not finish in time"
            );
        }

        tracing::info!(sessions_closed = closed, "Broker stopped");
    }
}

// =============================================================================
// Accept and session tasks
// =============================================================================

struct Acceptor {
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn BrokerHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    next_id: Arc<AtomicU64>,
    wire_format: WireFormat,
    max_message_size: usize,
    send_queue_capacity: usize,
}

impl Acceptor {
    async fn accept_loop(self, listener: TcpListener) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                () = this.cancel.cancelled() => {
                    tracing::debug!("Broker accept loop stopped");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let acceptor = Arc::clone(&this);
                            this.tracker.spawn(async move {
                                acceptor.serve(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let config = WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size));

        let ws = match accept_async_with_config(stream, Some(config)).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, mut source) = ws.split();
        let (session, rx) = Session::new(id, peer, self.wire_format, self.send_queue_capacity);

        self.registry.insert(Arc::new(session));
        tracing::info!(session = %id, peer = %peer, "Client connected");
        self.handler.on_connect(id).await;

        self.tracker.spawn(write_loop(id, sink, rx));

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handler.on_message(id, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handler.on_message(id, text).await,
                            Err(e) => {
                                tracing::warn!(session = %id, error = %e, "Dropping non-UTF-8 frame");
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) if is_shutdown_noise(&e) => break,
                        Some(Err(e)) => {
                            tracing::warn!(session = %id, error = %e, "Session read failed");
                            self.handler.on_error(id, &e.to_string()).await;
                            break;
                        }
                    }
                }
            }
        }

        self.registry.remove(id);
        tracing::info!(session = %id, "Client disconnected");
        self.handler.on_disconnect(id).await;
    }
}
