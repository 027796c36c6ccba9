//! HTTP Transport Integration Tests
//!
//! Exercises the reqwest transport against a wiremock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use deribit_bridge::{HttpTransport, RpcTransport, TransportError};

const TIMEOUT: Duration = Duration::from_secs(5);

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(&server.uri(), TIMEOUT).unwrap()
}

#[tokio::test]
async fn posts_json_with_bearer_token() {
    let server = MockServer::start().await;
    let body = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "private/cancel",
        "params": { "order_id": "ETH-1" },
    });
    let reply = json!({"jsonrpc": "2.0", "id": 7, "result": {"order_state": "cancelled"}});

    Mock::given(method("POST"))
        .and(path("/api/v2/private/cancel"))
        .and(header("authorization", "Bearer token-1"))
        .and(body_json(&body))
        .respond_with(ResponseTemplate::new(200).set_body_json(&reply))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(&server)
        .post("/api/v2/private/cancel", &body, Some("token-1"))
        .await
        .unwrap();

    assert_eq!(response, reply);
}

#[tokio::test]
async fn auth_requests_carry_no_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
        .mount(&server)
        .await;

    transport(&server)
        .post("/api/v2", &json!({"method": "public/auth"}), None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn json_error_bodies_are_returned() {
    let server = MockServer::start().await;
    let reply = json!({
        "jsonrpc": "2.0",
        "id": 3,
        "error": { "code": 13009, "message": "unauthorized" },
    });
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(&reply))
        .mount(&server)
        .await;

    let response = transport(&server)
        .post("/api/v2/private/buy", &json!({}), Some("stale"))
        .await
        .unwrap();

    assert_eq!(response, reply);
}

#[tokio::test]
async fn non_json_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post("/api/v2/private/buy", &json!({}), None)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        TransportError::Status {
            status: 502,
            body: "Bad Gateway".to_string(),
        }
    );
}

#[tokio::test]
async fn non_json_success_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let err = transport(&server)
        .post("/api/v2/public/get_instrument", &json!({}), None)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Decode(_)));
}

#[tokio::test]
async fn unreachable_host_is_a_request_error() {
    // Nothing listens on port 1.
    let transport = HttpTransport::new("http://127.0.0.1:1", TIMEOUT).unwrap();

    let err = transport
        .post("/api/v2", &json!({}), None)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Request(_)));
}

#[tokio::test]
async fn trailing_slash_on_base_url_is_trimmed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/public/test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&format!("{}/", server.uri()), TIMEOUT).unwrap();
    transport
        .post("/api/v2/public/test", &json!({}), None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].url.path(), "/api/v2/public/test");
}
