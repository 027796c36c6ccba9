//! Exchange Channel and Client Request Types
//!
//! Deribit names every event stream with a dotted channel string:
//!
//! - `book.<instrument>.<interval>` - order book updates
//! - `user.position.<instrument>` - position updates (private)
//!
//! Local clients ask for those streams with a small JSON request:
//!
//! ```json
//! {"method": "subscribe_orderbook", "symbol": "BTC-PERPETUAL"}
//! ```

use serde::Deserialize;

use crate::domain::subscription::SubscriptionKind;

// =============================================================================
// Constants
// =============================================================================

/// Prefix of order book channels.
pub const BOOK_PREFIX: &str = "book.";

/// Prefix of position channels.
pub const POSITION_PREFIX: &str = "user.position.";

/// Default order book update interval.
pub const DEFAULT_BOOK_INTERVAL: &str = "100ms";

// =============================================================================
// Channel Classification
// =============================================================================

/// A routable event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    /// Event kind.
    pub kind: SubscriptionKind,
    /// Instrument name.
    pub symbol: String,
}

/// Classify a channel string.
///
/// Returns `None` for channels that are not routed to local clients.
///
/// # Example
///
/// ```
/// use deribit_bridge::domain::streaming::classify_channel;
/// use deribit_bridge::domain::subscription::SubscriptionKind;
///
/// let target = classify_channel("book.BTC-PERPETUAL.100ms").unwrap();
/// assert_eq!(target.kind, SubscriptionKind::Orderbook);
/// assert_eq!(target.symbol, "BTC-PERPETUAL");
///
/// assert!(classify_channel("ticker.BTC-PERPETUAL.raw").is_none());
/// ```
#[must_use]
pub fn classify_channel(channel: &str) -> Option<ChannelTarget> {
    if let Some(rest) = channel.strip_prefix(BOOK_PREFIX) {
        let symbol = rest.split('.').next().unwrap_or_default();
        return target(SubscriptionKind::Orderbook, symbol);
    }

    if let Some(symbol) = channel.strip_prefix(POSITION_PREFIX) {
        return target(SubscriptionKind::Position, symbol);
    }

    None
}

fn target(kind: SubscriptionKind, symbol: &str) -> Option<ChannelTarget> {
    if symbol.is_empty() {
        return None;
    }
    Some(ChannelTarget {
        kind,
        symbol: symbol.to_string(),
    })
}

/// Channel name for an order book subscription.
#[must_use]
pub fn orderbook_channel(symbol: &str, interval: &str) -> String {
    format!("{BOOK_PREFIX}{symbol}.{interval}")
}

/// Channel name for a position subscription.
#[must_use]
pub fn position_channel(symbol: &str) -> String {
    format!("{POSITION_PREFIX}{symbol}")
}

// =============================================================================
// Client Requests
// =============================================================================

/// Raw request frame sent by a local client.
#[derive(Debug, Clone, Deserialize)]
struct RawClientRequest {
    method: String,
    symbol: String,
}

/// A recognised local client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `subscribe_orderbook`
    SubscribeOrderbook {
        /// Instrument name.
        symbol: String,
    },
    /// `subscribe_position`
    SubscribePosition {
        /// Instrument name.
        symbol: String,
    },
}

impl ClientRequest {
    /// Subscription kind requested.
    #[must_use]
    pub const fn kind(&self) -> SubscriptionKind {
        match self {
            Self::SubscribeOrderbook { .. } => SubscriptionKind::Orderbook,
            Self::SubscribePosition { .. } => SubscriptionKind::Position,
        }
    }

    /// Instrument name requested.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::SubscribeOrderbook { symbol } | Self::SubscribePosition { symbol } => symbol,
        }
    }
}

/// Why a client frame was not understood.
#[derive(Debug, thiserror::Error)]
pub enum ClientRequestError {
    /// Frame is not JSON or lacks `method`/`symbol`.
    #[error("malformed client request: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `method` is not a known subscription.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// `symbol` is empty.
    #[error("empty symbol")]
    EmptySymbol,
}

/// Parse a text frame from a local client.
///
/// # Errors
///
/// Returns `ClientRequestError` when the frame is malformed, names an
/// unknown method, or carries an empty symbol.
pub fn parse_client_request(text: &str) -> Result<ClientRequest, ClientRequestError> {
    let raw: RawClientRequest = serde_json::from_str(text)?;

    if raw.symbol.is_empty() {
        return Err(ClientRequestError::EmptySymbol);
    }

    match raw.method.as_str() {
        "subscribe_orderbook" => Ok(ClientRequest::SubscribeOrderbook { symbol: raw.symbol }),
        "subscribe_position" => Ok(ClientRequest::SubscribePosition { symbol: raw.symbol }),
        _ => Err(ClientRequestError::UnknownMethod(raw.method)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("book.BTC-PERPETUAL.100ms", Some((SubscriptionKind::Orderbook, "BTC-PERPETUAL")) ; "book with interval")]
    #[test_case("book.ETH-PERPETUAL.raw", Some((SubscriptionKind::Orderbook, "ETH-PERPETUAL")) ; "book raw")]
    #[test_case("book.BTC", Some((SubscriptionKind::Orderbook, "BTC")) ; "book without interval")]
    #[test_case("user.position.BTC-PERPETUAL", Some((SubscriptionKind::Position, "BTC-PERPETUAL")) ; "position")]
    #[test_case("user.position.", None ; "position without symbol")]
    #[test_case("book.", None ; "book without symbol")]
    #[test_case("ticker.BTC-PERPETUAL.100ms", None ; "ticker ignored")]
    #[test_case("user.orders.BTC-PERPETUAL.raw", None ; "orders ignored")]
    #[test_case("", None ; "empty")]
    fn channel_classification(channel: &str, expected: Option<(SubscriptionKind, &str)>) {
        let got = classify_channel(channel).map(|t| (t.kind, t.symbol));
        assert_eq!(got, expected.map(|(k, s)| (k, s.to_string())));
    }

    #[test]
    fn channel_builders() {
        assert_eq!(
            orderbook_channel("BTC-PERPETUAL", DEFAULT_BOOK_INTERVAL),
            "book.BTC-PERPETUAL.100ms"
        );
        assert_eq!(
            position_channel("BTC-PERPETUAL"),
            "user.position.BTC-PERPETUAL"
        );
    }

    #[test]
    fn parse_subscribe_orderbook() {
        let req =
            parse_client_request(r#"{"method":"subscribe_orderbook","symbol":"BTC-PERPETUAL"}"#)
                .unwrap();
        assert_eq!(req.kind(), SubscriptionKind::Orderbook);
        assert_eq!(req.symbol(), "BTC-PERPETUAL");
    }

    #[test]
    fn parse_subscribe_position() {
        let req =
            parse_client_request(r#"{"method":"subscribe_position","symbol":"ETH-PERPETUAL"}"#)
                .unwrap();
        assert_eq!(
            req,
            ClientRequest::SubscribePosition {
                symbol: "ETH-PERPETUAL".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_bad_frames() {
        assert!(matches!(
            parse_client_request("not json"),
            Err(ClientRequestError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_request(r#"{"method":"subscribe_orderbook"}"#),
            Err(ClientRequestError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_request(r#"{"method":"unsubscribe","symbol":"BTC-PERPETUAL"}"#),
            Err(ClientRequestError::UnknownMethod(m)) if m == "unsubscribe"
        ));
        assert!(matches!(
            parse_client_request(r#"{"method":"subscribe_position","symbol":""}"#),
            Err(ClientRequestError::EmptySymbol)
        ));
    }

    proptest! {
        #[test]
        fn book_symbol_is_second_segment(
            symbol in "[A-Z0-9][A-Z0-9_-]{0,24}",
            interval in "[a-z0-9]{1,8}",
        ) {
            let target = classify_channel(&orderbook_channel(&symbol, &interval)).unwrap();
            prop_assert_eq!(target.kind, SubscriptionKind::Orderbook);
            prop_assert_eq!(target.symbol, symbol);
        }

        #[test]
        fn position_symbol_is_trailing_part(symbol in "[A-Z0-9][A-Z0-9_.-]{0,24}") {
            let target = classify_channel(&position_channel(&symbol)).unwrap();
            prop_assert_eq!(target.kind, SubscriptionKind::Position);
            prop_assert_eq!(target.symbol, symbol);
        }

        #[test]
        fn unknown_prefixes_are_ignored(channel in "[a-z]{1,10}\\.[A-Z-]{1,10}") {
            prop_assume!(!channel.starts_with(BOOK_PREFIX));
            prop_assert!(classify_channel(&channel).is_none());
        }
    }
}
