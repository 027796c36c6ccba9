//! Local client session.
//!
//! Writes go through a bounded channel to a per-session writer task, so
//! frames leave in the order they were queued and callers never wait on a
//! slow client. When a client falls a full queue behind, further payloads
//! are dropped and counted until the writer catches up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::domain::subscription::SessionId;
use crate::infrastructure::metrics;

/// Default number of frames queued per session before payloads are dropped.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Frame type used for outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// UTF-8 text frames.
    #[default]
    Text,
    /// Binary frames carrying the same JSON bytes.
    Binary,
}

impl WireFormat {
    /// `Binary` when `binary` is set.
    #[must_use]
    pub const fn from_binary_flag(binary: bool) -> Self {
        if binary { Self::Binary } else { Self::Text }
    }

    /// Wrap a payload in the matching frame.
    #[must_use]
    pub fn frame(self, payload: &str) -> Message {
        match self {
            Self::Text => Message::text(payload.to_string()),
            Self::Binary => Message::binary(payload.as_bytes().to_vec()),
        }
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    format: WireFormat,
    tx: mpsc::Sender<Message>,
    dropped: AtomicU64,
}

impl Session {
    /// Create a session and the receiving end of its write queue, which
    /// holds at most `capacity` frames.
    #[must_use]
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        format: WireFormat,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                peer,
                format,
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a payload. Returns `false` if the writer has exited or the
    /// queue is full, in which case the payload is dropped.
    pub fn send(&self, payload: &str) -> bool {
        self.enqueue(self.format.frame(payload))
    }

    /// Queue a normal-closure close frame.
    pub fn close(&self) -> bool {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        };
        self.enqueue(Message::Close(Some(frame)))
    }

    fn enqueue(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_session_message_dropped();
                tracing::warn!(
                    session = %self.id,
                    peer = %self.peer,
                    dropped,
                    "Session send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Drain a session's write queue into its socket. Ends after a close frame
/// is written, on write failure, or when every sender is gone.
pub(crate) async fn write_loop(
    id: SessionId,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = message.is_close();
        if let Err(e) = sink.send(message).await {
            tracing::debug!(session = %id, error = %e, "Session write failed");
            break;
        }
        if closing {
            break;
        }
    }
}
