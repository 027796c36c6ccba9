//! Bridge Routing Integration Tests
//!
//! Runs the manager against a local fake exchange and real WebSocket
//! clients: subscribe requests go upstream, events fan out only to the
//! sessions that asked for them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::net::SocketAddr;

use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use common::{
    FakeExchange, WS_PATH, client, event, eventually, is_quiet, next_frame, next_json, send,
    send_text,
};
use deribit_bridge::{BrokerSettings, Connector, Manager, WireFormat};

async fn setup(wire_format: WireFormat) -> (Manager, SocketAddr, FakeExchange) {
    let exchange = FakeExchange::start().await;

    let settings = BrokerSettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        wire_format,
        ..BrokerSettings::default()
    };
    let manager = Manager::new(Connector::plaintext(), settings, "100ms");
    let addr = manager.start().await.unwrap();
    manager
        .connect_upstream("127.0.0.1", exchange.port, WS_PATH)
        .await
        .unwrap();
    assert!(manager.is_connected());

    (manager, addr, exchange)
}

#[tokio::test]
async fn orderbook_events_reach_only_subscribed_clients() {
    let (manager, addr, mut exchange) = setup(WireFormat::Text).await;

    let mut subscriber = client(addr).await;
    let mut bystander = client(addr).await;

    send(
        &mut subscriber,
        &json!({"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"}),
    )
    .await;

    let request = exchange.next_request().await;
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "public/subscribe");
    assert_eq!(
        request["params"]["channels"],
        json!(["book.BTC-PERPETUAL.100ms"])
    );

    let subscriptions = manager.subscriptions();
    eventually(|| subscriptions.len() == 1).await;

    let data = json!({"bids": [[50000.0, 10.0]], "asks": [[50001.0, 5.0]], "change_id": 7});
    exchange.push(&event("book.BTC-PERPETUAL.100ms", &data));

    assert_eq!(next_json(&mut subscriber).await, data);
    assert!(is_quiet(&mut bystander).await);

    manager.stop().await;
}

#[tokio::test]
async fn position_subscription_uses_private_channel() {
    let (manager, addr, mut exchange) = setup(WireFormat::Text).await;

    let mut trader = client(addr).await;
    send(
        &mut trader,
        &json!({"method": "subscribe_position", "symbol": "ETH-PERPETUAL"}),
    )
    .await;

    let request = exchange.next_request().await;
    assert_eq!(request["method"], "private/subscribe");
    assert_eq!(
        request["params"]["channels"],
        json!(["user.position.ETH-PERPETUAL"])
    );

    let subscriptions = manager.subscriptions();
    eventually(|| subscriptions.len() == 1).await;

    // Same symbol on the other kind is not delivered.
    exchange.push(&event("book.ETH-PERPETUAL.100ms", &json!({"bids": []})));
    let position = json!({"instrument_name": "ETH-PERPETUAL", "size": 3.0});
    exchange.push(&event("user.position.ETH-PERPETUAL", &position));

    assert_eq!(next_json(&mut trader).await, position);
    assert!(is_quiet(&mut trader).await);

    manager.stop().await;
}

#[tokio::test]
async fn every_subscriber_of_a_symbol_receives_the_event() {
    let (manager, addr, mut exchange) = setup(WireFormat::Text).await;

    let mut first = client(addr).await;
    let mut second = client(addr).await;
    let subscribe = json!({"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"});
    send(&mut first, &subscribe).await;
    send(&mut second, &subscribe).await;

    exchange.next_request().await;
    exchange.next_request().await;

    let subscriptions = manager.subscriptions();
    eventually(|| subscriptions.len() == 2).await;

    let data = json!({"bids": [[1.0, 1.0]]});
    exchange.push(&event("book.BTC-PERPETUAL.100ms", &data));

    assert_eq!(next_json(&mut first).await, data);
    assert_eq!(next_json(&mut second).await, data);

    manager.stop().await;
}

#[tokio::test]
async fn malformed_client_requests_send_nothing_upstream() {
    let (manager, addr, mut exchange) = setup(WireFormat::Text).await;

    let mut session = client(addr).await;
    send_text(&mut session, "not json at all").await;
    send(
        &mut session,
        &json!({"method": "subscribe_trades", "symbol": "BTC-PERPETUAL"}),
    )
    .await;
    send(&mut session, &json!({"method": "subscribe_orderbook"})).await;

    assert!(exchange.is_quiet().await);
    assert!(manager.subscriptions().is_empty());
    assert_eq!(manager.sessions().len(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn disconnected_clients_lose_their_subscriptions() {
    let (manager, addr, mut exchange) = setup(WireFormat::Text).await;

    let mut leaving = client(addr).await;
    let mut staying = client(addr).await;
    send(
        &mut leaving,
        &json!({"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"}),
    )
    .await;
    send(
        &mut staying,
        &json!({"method": "subscribe_position", "symbol": "BTC-PERPETUAL"}),
    )
    .await;
    exchange.next_request().await;
    exchange.next_request().await;

    let subscriptions = manager.subscriptions();
    let sessions = manager.sessions();
    eventually(|| subscriptions.len() == 2).await;

    leaving.close(None).await.unwrap();
    drop(leaving);

    eventually(|| sessions.len() == 1 && subscriptions.len() == 1).await;

    // Events for the departed session's channel go nowhere.
    exchange.push(&event("book.BTC-PERPETUAL.100ms", &json!({"bids": []})));
    assert!(is_quiet(&mut staying).await);

    manager.stop().await;
}

#[tokio::test]
async fn binary_wire_format_sends_binary_frames() {
    let (manager, addr, mut exchange) = setup(WireFormat::Binary).await;

    let mut session = client(addr).await;
    send(
        &mut session,
        &json!({"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"}),
    )
    .await;
    exchange.next_request().await;

    let subscriptions = manager.subscriptions();
    eventually(|| subscriptions.len() == 1).await;

    let data = json!({"asks": [[2.0, 3.0]]});
    exchange.push(&event("book.BTC-PERPETUAL.100ms", &data));

    match next_frame(&mut session).await {
        Message::Binary(bytes) => {
            let received: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(received, data);
        }
        other => panic!("expected binary frame, got {other:?}"),
    }

    manager.stop().await;
}

#[tokio::test]
async fn subscribe_while_disconnected_is_dropped() {
    let settings = BrokerSettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..BrokerSettings::default()
    };
    let manager = Manager::new(Connector::plaintext(), settings, "100ms");
    let addr = manager.start().await.unwrap();

    let mut session = client(addr).await;
    send(
        &mut session,
        &json!({"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"}),
    )
    .await;

    let sessions = manager.sessions();
    eventually(|| sessions.len() == 1).await;
    assert!(is_quiet(&mut session).await);
    assert!(manager.subscriptions().is_empty());
    assert!(manager.is_running());

    manager.stop().await;
}

#[tokio::test]
async fn exchange_close_stops_the_bridge() {
    let (manager, _addr, exchange) = setup(WireFormat::Text).await;
    assert!(manager.is_running());

    exchange.close();

    eventually(|| !manager.is_running()).await;
    assert!(!manager.is_connected());

    manager.stop().await;
}

#[tokio::test]
async fn stop_closes_local_clients() {
    let (manager, addr, _exchange) = setup(WireFormat::Text).await;

    let mut session = client(addr).await;
    let sessions = manager.sessions();
    eventually(|| sessions.len() == 1).await;

    manager.stop().await;

    assert!(matches!(next_frame(&mut session).await, Message::Close(_)));
    assert!(sessions.is_empty());
    assert!(!manager.is_running());
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn raw_lines_are_forwarded_upstream() {
    let (manager, _addr, mut exchange) = setup(WireFormat::Text).await;

    let raw = json!({"jsonrpc": "2.0", "id": 42, "method": "public/test", "params": {}});
    manager.send_upstream(&raw.to_string()).await.unwrap();

    assert_eq!(exchange.next_request().await, raw);

    manager.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_live_session() {
    let (manager, addr, _exchange) = setup(WireFormat::Text).await;

    let mut first = client(addr).await;
    let mut second = client(addr).await;
    let sessions = manager.sessions();
    eventually(|| sessions.len() == 2).await;

    let notice = json!({"notice": "maintenance"});
    assert_eq!(manager.broker().broadcast(&notice.to_string()), 2);

    assert_eq!(next_json(&mut first).await, notice);
    assert_eq!(next_json(&mut second).await, notice);

    manager.stop().await;
}
