//! Order Composition
//!
//! Validates order arguments and builds the parameter objects for
//! `private/buy`, `private/sell` and `private/edit`.
//!
//! Amounts and prices are `Decimal` in memory and plain JSON numbers on
//! the wire, matching what the exchange expects.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Order validation errors. Raised before anything is queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Side is not exactly `buy` or `sell`.
    #[error("invalid side '{0}': expected 'buy' or 'sell'")]
    InvalidSide(String),

    /// Order type is not recognised.
    #[error("invalid order type '{0}': expected market, limit, stop_market or stop_limit")]
    InvalidType(String),

    /// Amount is zero or negative.
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    /// Order type needs a price and none was given.
    #[error("{0} orders require a price")]
    MissingPrice(OrderType),

    /// A required identifier is empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

// =============================================================================
// Side and Type
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Trading API method for this side.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Buy => "private/buy",
            Self::Sell => "private/sell",
        }
    }

    /// Side name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl FromStr for OrderSide {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(OrderError::InvalidSide(other.to_string())),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop order that becomes a market order when triggered.
    StopMarket,
    /// Stop order that becomes a limit order when triggered.
    StopLimit,
}

impl OrderType {
    /// Type name as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::StopMarket => "stop_market",
            Self::StopLimit => "stop_limit",
        }
    }

    /// Whether the order rests at a limit price.
    #[must_use]
    pub const fn has_limit_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit)
    }

    /// Whether the order waits for a trigger.
    #[must_use]
    pub const fn is_stop(self) -> bool {
        matches!(self, Self::StopMarket | Self::StopLimit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            "stop_market" => Ok(Self::StopMarket),
            "stop_limit" => Ok(Self::StopLimit),
            other => Err(OrderError::InvalidType(other.to_string())),
        }
    }
}

/// Price source for stop triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Last traded price.
    LastPrice,
}

// =============================================================================
// Parameter Objects
// =============================================================================

/// Parameters for `private/buy` and `private/sell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderParams {
    /// Instrument name.
    pub instrument_name: String,
    /// Order size.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Order type.
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Limit price (limit and stop-limit only).
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<Decimal>,
    /// Trigger source (stop orders only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    /// Trigger price (stop orders only).
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger_price: Option<Decimal>,
    /// Only reduce an existing position. Omitted unless set.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reduce_only: bool,
}

/// A validated new-order request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Side, which selects the API method.
    pub side: OrderSide,
    /// Parameters for the API call.
    pub params: OrderParams,
}

impl OrderRequest {
    /// Validate arguments and compose the order.
    ///
    /// `price` is the limit price for limit orders and the trigger price for
    /// stop orders; a stop-limit order uses it for both. It is ignored for
    /// market orders.
    ///
    /// # Errors
    ///
    /// Returns `OrderError` if the side or type is unknown, the instrument is
    /// empty, the amount is not positive, or a required price is missing.
    pub fn compose(
        instrument: &str,
        side: &str,
        order_type: &str,
        amount: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
    ) -> Result<Self, OrderError> {
        let side: OrderSide = side.parse()?;
        let order_type: OrderType = order_type.parse()?;

        if instrument.is_empty() {
            return Err(OrderError::EmptyField("instrument"));
        }
        if amount <= Decimal::ZERO {
            return Err(OrderError::InvalidAmount(amount));
        }

        let needs_price = order_type.has_limit_price() || order_type.is_stop();
        let price = match (needs_price, price) {
            (true, None) => return Err(OrderError::MissingPrice(order_type)),
            (true, Some(p)) => Some(p),
            (false, _) => None,
        };

        let params = OrderParams {
            instrument_name: instrument.to_string(),
            amount,
            order_type,
            price: price.filter(|_| order_type.has_limit_price()),
            trigger: order_type.is_stop().then_some(Trigger::LastPrice),
            trigger_price: price.filter(|_| order_type.is_stop()),
            reduce_only,
        };

        Ok(Self { side, params })
    }

    /// Trading API method.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.side.method()
    }
}

/// Parameters for `private/edit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditParams {
    /// Order to amend.
    pub order_id: String,
    /// New size.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// New price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

impl EditParams {
    /// Validate and compose edit parameters.
    ///
    /// # Errors
    ///
    /// Returns `OrderError` if the order id is empty or the amount is not
    /// positive.
    pub fn compose(order_id: &str, price: Decimal, amount: Decimal) -> Result<Self, OrderError> {
        if order_id.is_empty() {
            return Err(OrderError::EmptyField("order_id"));
        }
        if amount <= Decimal::ZERO {
            return Err(OrderError::InvalidAmount(amount));
        }
        Ok(Self {
            order_id: order_id.to_string(),
            amount,
            price,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
