//! Subscription Router
//!
//! Turns local subscribe requests into upstream subscribe calls and fans
//! upstream events out to the sessions that asked for them.
//!
//! # Flow
//!
//! ```text
//! client ──subscribe_orderbook──► Router ──public/subscribe──► Deribit
//!                                   │ add entry (kind, symbol, session)
//! Deribit ──book.BTC-PERPETUAL.100ms──► Router ──data──► matching sessions
//! ```
//!
//! Subscription entries hold session ids, not sessions. A closed session
//! is pruned on disconnect and again by the purge that precedes every
//! fan-out, so payloads never go to a session known to be gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::application::ports::{
    BrokerHandler, ConnectorHandler, SessionDirectory, UpstreamError, UpstreamPort,
};
use crate::domain::streaming::{
    ClientRequest, classify_channel, orderbook_channel, parse_client_request, position_channel,
};
use crate::domain::subscription::{SessionId, SubscriptionKind, SubscriptionRegistry};
use crate::infrastructure::deribit::codec::{InboundMessage, JsonCodec};
use crate::infrastructure::deribit::messages::{SubscribeScope, subscribe_request};
use crate::infrastructure::metrics;

/// Errors from a subscribe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// Upstream is not open, nothing was sent.
    #[error("cannot subscribe, not connected to Deribit")]
    NotConnected,

    /// Subscribe request failed to serialize.
    #[error("failed to encode subscribe request: {0}")]
    Encode(String),

    /// Upstream write failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Routes between the exchange connection and local sessions.
pub struct Router {
    upstream: Arc<dyn UpstreamPort>,
    sessions: Arc<dyn SessionDirectory>,
    subscriptions: Arc<SubscriptionRegistry>,
    codec: JsonCodec,
    book_interval: String,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Router {
    /// Create a router. It starts in the running state.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamPort>,
        sessions: Arc<dyn SessionDirectory>,
        book_interval: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            sessions,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            codec: JsonCodec::new(),
            book_interval: book_interval.into(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        }
    }

    /// Subscription entries.
    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.subscriptions)
    }

    /// False once the upstream connection has closed or [`halt`](Self::halt)
    /// was called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drop the running flag.
    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Send the upstream subscribe for `request` and record an entry for
    /// `session`. The entry is only recorded once the subscribe was written.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::NotConnected` without sending anything when the
    /// upstream is not open, or the write error.
    pub async fn subscribe(
        &self,
        session: SessionId,
        request: &ClientRequest,
    ) -> Result<(), RouteError> {
        if !self.upstream.is_open() {
            return Err(RouteError::NotConnected);
        }

        let symbol = request.symbol();
        let (scope, channel) = match request.kind() {
            SubscriptionKind::Orderbook => (
                SubscribeScope::Public,
                orderbook_channel(symbol, &self.book_interval),
            ),
            SubscriptionKind::Position => (SubscribeScope::Private, position_channel(symbol)),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = subscribe_request(scope, id, vec![channel.clone()])
            .to_json()
            .map_err(|e| RouteError::Encode(e.to_string()))?;

        self.upstream.send_text(&payload).await?;
        self.subscriptions.add(request.kind(), symbol, session);
        metrics::set_subscription_entries(self.subscriptions.len());

        tracing::info!(
            session = %session,
            kind = request.kind().as_str(),
            channel = %channel,
            request_id = id,
            "Subscribed"
        );
        Ok(())
    }

    /// Deliver an event payload to every live session subscribed to its
    /// channel. Returns the number of sessions that accepted it.
    pub fn route_event(&self, channel: &str, data: &Value) -> usize {
        let Some(target) = classify_channel(channel) else {
            tracing::trace!(channel, "Ignoring unrouted channel");
            return 0;
        };

        let purged = self.subscriptions.purge(|s| self.sessions.is_live(s));
        if purged > 0 {
            metrics::set_subscription_entries(self.subscriptions.len());
        }

        let recipients = self.subscriptions.matching(target.kind, &target.symbol);
        if recipients.is_empty() {
            return 0;
        }

        let payload = data.to_string();
        let delivered = recipients
            .into_iter()
            .filter(|session| self.sessions.deliver(*session, &payload))
            .count();

        metrics::record_events_routed(delivered as u64);
        tracing::trace!(channel, delivered, "Routed event");
        delivered
    }
}

#[async_trait]
impl ConnectorHandler for Router {
    async fn on_open(&self) {
        tracing::info!("Deribit WebSocket connected");
    }

    async fn on_message(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(InboundMessage::Ack { id, error: Some(error) }) => {
                tracing::warn!(request_id = %id, error = %error, "Subscription error");
            }
            Ok(InboundMessage::Ack { id, error: None }) => {
                tracing::debug!(request_id = %id, "Subscription acknowledged");
            }
            Ok(InboundMessage::Event { channel, data }) => {
                self.route_event(&channel, &data);
            }
            Ok(InboundMessage::Other(value)) => {
                tracing::trace!(message = %value, "Ignoring upstream message");
            }
            Err(e) => {
                tracing::debug!(error = %e, raw = text, "Unparsed upstream frame");
            }
        }
    }

    async fn on_close(&self) {
        tracing::info!("Deribit connection closed");
        self.halt();
    }

    async fn on_error(&self, message: &str) {
        tracing::error!(error = message, "Deribit WebSocket error");
    }
}

#[async_trait]
impl BrokerHandler for Router {
    async fn on_connect(&self, session: SessionId) {
        tracing::debug!(session = %session, live = self.sessions.live_count(), "Session ready");
    }

    async fn on_message(&self, session: SessionId, text: &str) {
        let request = match parse_client_request(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(session = %session, error = %e, raw = text, "Invalid client message");
                return;
            }
        };

        if let Err(e) = self.subscribe(session, &request).await {
            tracing::warn!(session = %session, symbol = request.symbol(), error = %e, "Subscribe failed");
        }
    }

    async fn on_disconnect(&self, session: SessionId) {
        let removed = self.subscriptions.remove_session(session);
        metrics::set_subscription_entries(self.subscriptions.len());
        tracing::debug!(session = %session, entries_removed = removed, "Session subscriptions cleared");
    }

    async fn on_error(&self, session: SessionId, message: &str) {
        tracing::warn!(session = %session, error = message, "Session error");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::application::ports::{MockSessionDirectory, MockUpstreamPort};
    use crate::infrastructure::broker::{
        DEFAULT_SEND_QUEUE_CAPACITY, Session, SessionRegistry, WireFormat,
    };

    fn open_upstream() -> MockUpstreamPort {
        let mut upstream = MockUpstreamPort::new();
        upstream.expect_is_open().return_const(true);
        upstream
    }

    fn session(registry: &SessionRegistry, raw: u64) -> Receiver<Message> {
        let (session, rx) = Session::new(
            SessionId::new(raw),
            "127.0.0.1:1".parse().unwrap(),
            WireFormat::Text,
            DEFAULT_SEND_QUEUE_CAPACITY,
        );
        registry.insert(Arc::new(session));
        rx
    }

    fn received(rx: &mut Receiver<Message>) -> Value {
        let frame = rx.try_recv().unwrap().into_text().unwrap();
        serde_json::from_str(frame.as_str()).unwrap()
    }

    #[tokio::test]
    async fn orderbook_subscribe_sends_public_subscribe() {
        let mut upstream = open_upstream();
        upstream
            .expect_send_text()
            .withf(|text| {
                let sent: Value = serde_json::from_str(text).unwrap();
                sent["method"] == "public/subscribe"
                    && sent["params"]["channels"] == json!(["book.BTC-PERPETUAL.100ms"])
                    && sent["jsonrpc"] == "2.0"
            })
            .times(1)
            .returning(|_| Ok(()));

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        BrokerHandler::on_message(
            &router,
            SessionId::new(1),
            r#"{"method":"subscribe_orderbook","symbol":"BTC-PERPETUAL"}"#,
        )
        .await;

        let entries = router.subscriptions().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, SubscriptionKind::Orderbook);
        assert_eq!(entries[0].symbol, "BTC-PERPETUAL");
        assert_eq!(entries[0].session, SessionId::new(1));
    }

    #[tokio::test]
    async fn position_subscribe_sends_private_subscribe() {
        let mut upstream = open_upstream();
        upstream
            .expect_send_text()
            .withf(|text| {
                let sent: Value = serde_json::from_str(text).unwrap();
                sent["method"] == "private/subscribe"
                    && sent["params"]["channels"] == json!(["user.position.ETH-PERPETUAL"])
            })
            .times(1)
            .returning(|_| Ok(()));

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        let request = ClientRequest::SubscribePosition {
            symbol: "ETH-PERPETUAL".to_string(),
        };
        router.subscribe(SessionId::new(7), &request).await.unwrap();

        assert_eq!(router.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn book_interval_is_configurable() {
        let mut upstream = open_upstream();
        upstream
            .expect_send_text()
            .withf(|text| text.contains("book.BTC-PERPETUAL.raw"))
            .times(1)
            .returning(|_| Ok(()));

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "raw");
        let request = ClientRequest::SubscribeOrderbook {
            symbol: "BTC-PERPETUAL".to_string(),
        };
        router.subscribe(SessionId::new(1), &request).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_sends_nothing() {
        let mut upstream = MockUpstreamPort::new();
        upstream.expect_is_open().return_const(false);
        upstream.expect_send_text().never();

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        let request = ClientRequest::SubscribeOrderbook {
            symbol: "BTC-PERPETUAL".to_string(),
        };

        let err = router.subscribe(SessionId::new(1), &request).await.unwrap_err();
        assert_eq!(err, RouteError::NotConnected);
        assert!(router.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn failed_send_records_no_entry() {
        let mut upstream = open_upstream();
        upstream
            .expect_send_text()
            .times(1)
            .returning(|_| Err(UpstreamError::SendFailed("broken pipe".to_string())));

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        let request = ClientRequest::SubscribeOrderbook {
            symbol: "BTC-PERPETUAL".to_string(),
        };

        let err = router.subscribe(SessionId::new(1), &request).await.unwrap_err();
        assert!(matches!(err, RouteError::Upstream(_)));
        assert!(router.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn request_ids_increase() {
        let mut upstream = open_upstream();
        let (tx, rx) = std::sync::mpsc::channel::<u64>();
        upstream.expect_send_text().times(2).returning(move |text| {
            let sent: Value = serde_json::from_str(text).unwrap();
            tx.send(sent["id"].as_u64().unwrap()).unwrap();
            Ok(())
        });

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        let request = ClientRequest::SubscribeOrderbook {
            symbol: "BTC-PERPETUAL".to_string(),
        };
        router.subscribe(SessionId::new(1), &request).await.unwrap();
        router.subscribe(SessionId::new(1), &request).await.unwrap();

        let seen: Vec<u64> = rx.try_iter().collect();
        assert_eq!(seen.len(), 2);
        assert!(seen[1] > seen[0]);
        // Re-subscribing adds a second entry.
        assert_eq!(router.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn malformed_client_message_is_ignored() {
        let mut upstream = MockUpstreamPort::new();
        upstream.expect_is_open().never();
        upstream.expect_send_text().never();

        let router = Router::new(Arc::new(upstream), Arc::new(SessionRegistry::new()), "100ms");
        BrokerHandler::on_message(&router, SessionId::new(1), "not json").await;
        BrokerHandler::on_message(
            &router,
            SessionId::new(1),
            r#"{"method":"unsubscribe","symbol":"BTC"}"#,
        )
        .await;

        assert!(router.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn events_reach_only_matching_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut book_rx = session(&registry, 1);
        let mut other_rx = session(&registry, 2);
        let mut position_rx = session(&registry, 3);

        let router = Router::new(Arc::new(MockUpstreamPort::new()), registry, "100ms");
        let subs = router.subscriptions();
        subs.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(1));
        subs.add(SubscriptionKind::Orderbook, "ETH-PERPETUAL", SessionId::new(2));
        subs.add(SubscriptionKind::Position, "BTC-PERPETUAL", SessionId::new(3));

        ConnectorHandler::on_message(
            &router,
            r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.100ms","data":{"bids":[[100.5,10]],"asks":[]}}}"#,
        )
        .await;

        assert_eq!(
            received(&mut book_rx),
            json!({"bids": [[100.5, 10]], "asks": []})
        );
        assert!(other_rx.try_recv().is_err());
        assert!(position_rx.try_recv().is_err());

        let delivered = router.route_event("user.position.BTC-PERPETUAL", &json!({"size": 3}));
        assert_eq!(delivered, 1);
        assert_eq!(received(&mut position_rx), json!({"size": 3}));
        assert!(book_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acks_and_unknown_channels_are_not_routed() {
        let registry = Arc::new(SessionRegistry::new());
        let mut rx = session(&registry, 1);

        let router = Router::new(Arc::new(MockUpstreamPort::new()), registry, "100ms");
        router
            .subscriptions()
            .add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(1));

        ConnectorHandler::on_message(
            &router,
            r#"{"id":1,"params":{"channel":"book.BTC-PERPETUAL.100ms","data":{}}}"#,
        )
        .await;
        ConnectorHandler::on_message(
            &router,
            r#"{"id":2,"error":{"code":13009,"message":"unauthorized"}}"#,
        )
        .await;
        ConnectorHandler::on_message(&router, "garbage").await;
        assert_eq!(router.route_event("trades.BTC-PERPETUAL.100ms", &json!({})), 0);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_sessions_are_purged_before_delivery() {
        let mut sessions = MockSessionDirectory::new();
        sessions
            .expect_is_live()
            .returning(|s| s == SessionId::new(1));
        sessions
            .expect_deliver()
            .with(eq(SessionId::new(1)), eq("{\"v\":1}"))
            .times(1)
            .return_const(true);

        let router = Router::new(Arc::new(MockUpstreamPort::new()), Arc::new(sessions), "100ms");
        let subs = router.subscriptions();
        subs.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(1));
        subs.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(2));

        let delivered = router.route_event("book.BTC-PERPETUAL.100ms", &json!({"v": 1}));

        assert_eq!(delivered, 1);
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_entries() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Router::new(Arc::new(MockUpstreamPort::new()), registry, "100ms");
        let subs = router.subscriptions();
        subs.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(1));
        subs.add(SubscriptionKind::Position, "BTC-PERPETUAL", SessionId::new(2));

        BrokerHandler::on_disconnect(&router, SessionId::new(1)).await;

        assert_eq!(subs.len(), 1);
        assert_eq!(subs.entries()[0].session, SessionId::new(2));
    }

    #[tokio::test]
    async fn upstream_close_halts() {
        let router = Router::new(
            Arc::new(MockUpstreamPort::new()),
            Arc::new(SessionRegistry::new()),
            "100ms",
        );
        assert!(router.is_running());

        ConnectorHandler::on_close(&router).await;

        assert!(!router.is_running());
    }
}
