//! Shared fixtures for the WebSocket integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

/// How long a test waits for something that should happen.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// How long a test waits to be sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(200);

/// Path the bridge requests on the exchange endpoint.
pub const WS_PATH: &str = "/ws/api/v2";

// =============================================================================
// Fake Exchange
// =============================================================================

/// Single-connection WebSocket server standing in for Deribit.
pub struct FakeExchange {
    pub port: u16,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl FakeExchange {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut out_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let _ = in_tx.send(text.as_str().to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                    message = out_rx.recv() => match message {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            port,
            inbound,
            outbound,
        }
    }

    /// Next JSON request the bridge sent.
    pub async fn next_request(&mut self) -> Value {
        let text = timeout(PATIENCE, self.inbound.recv())
            .await
            .expect("no request reached the exchange")
            .expect("exchange connection ended");
        serde_json::from_str(&text).unwrap()
    }

    /// Whether the bridge sent nothing for a short while.
    pub async fn is_quiet(&mut self) -> bool {
        timeout(QUIET, self.inbound.recv()).await.is_err()
    }

    /// Push a frame to the bridge.
    pub fn push(&self, value: &Value) {
        self.outbound.send(Message::text(value.to_string())).unwrap();
    }

    /// Close the connection from the exchange side.
    pub fn close(&self) {
        self.outbound.send(Message::Close(None)).unwrap();
    }
}

/// A `subscription` notification for `channel`.
pub fn event(channel: &str, data: &Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": { "channel": channel, "data": data },
    })
}

// =============================================================================
// Local Clients
// =============================================================================

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn client(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

pub async fn send(client: &mut Client, value: &Value) {
    send_text(client, &value.to_string()).await;
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::text(text.to_string())).await.unwrap();
}

/// Next data-carrying frame, skipping ping and pong.
pub async fn next_frame(client: &mut Client) -> Message {
    timeout(PATIENCE, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(message)) => return message,
                Some(Err(e)) => panic!("client read failed: {e}"),
                None => panic!("client stream ended"),
            }
        }
    })
    .await
    .expect("no frame reached the client")
}

/// Next frame decoded as JSON. Panics on anything but a text frame.
pub async fn next_json(client: &mut Client) -> Value {
    match next_frame(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Whether the client received nothing for a short while.
pub async fn is_quiet(client: &mut Client) -> bool {
    timeout(QUIET, client.next()).await.is_err()
}

/// Poll `check` until it holds or patience runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
