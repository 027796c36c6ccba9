//! Interactive command parsing.

use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

/// Currency used by `positions` and `instruments` when none is given.
pub const DEFAULT_CURRENCY: &str = "BTC";

/// Instrument kind used by `instruments` when none is given.
pub const DEFAULT_KIND: &str = "future";

pub const HELP: &str = "\
Available commands:
  connect                               Connect to Deribit
  buy <type> <amount> [price]           Place a buy order (e.g. 'buy limit 10 50000')
  sell <type> <amount> [price]          Place a sell order (e.g. 'sell market 10')
  cancel <order_id>                     Cancel an order
  modify <order_id> <price> <amount>    Edit an open order
  orders                                List open orders
  state <order_id>                      Show one order
  orderbook [instrument]                Top of book
  positions [currency]                  Open positions (default BTC)
  instruments [currency] [kind]         Active instruments (default BTC future)
  instrument [name]                     Instrument details
  help                                  Show this message
  quit                                  Exit
Order types: market, limit, stop_market, stop_limit.
Any other line is sent to Deribit as-is while connected.";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Order {
        side: String,
        order_type: String,
        amount: Decimal,
        price: Option<Decimal>,
    },
    Cancel(String),
    Modify {
        order_id: String,
        price: Decimal,
        amount: Decimal,
    },
    Orders,
    State(String),
    Orderbook(Option<String>),
    Positions(Option<String>),
    Instruments {
        currency: Option<String>,
        kind: Option<String>,
    },
    Instrument(Option<String>),
    Help,
    Quit,
    /// Unrecognised line, forwarded upstream verbatim.
    Raw(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        let mut words = trimmed.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(Self::Empty);
        };
        let args: Vec<&str> = words.collect();
        let owned = |i: usize| args.get(i).map(|s| (*s).to_string());

        let command = match (head, args.len()) {
            ("connect", 0) => Self::Connect,
            ("help", 0) => Self::Help,
            ("quit" | "exit", 0) => Self::Quit,
            ("orders", 0) => Self::Orders,
            ("buy" | "sell", 2 | 3) => Self::Order {
                side: head.to_string(),
                order_type: args[0].to_string(),
                amount: decimal(args[1])?,
                price: args.get(2).copied().map(decimal).transpose()?,
            },
            ("buy" | "sell", _) => {
                return Err(CommandError::Usage("buy|sell <type> <amount> [price]"));
            }
            ("cancel", 1) => Self::Cancel(args[0].to_string()),
            ("cancel", _) => return Err(CommandError::Usage("cancel <order_id>")),
            ("modify", 3) => Self::Modify {
                order_id: args[0].to_string(),
                price: decimal(args[1])?,
                amount: decimal(args[2])?,
            },
            ("modify", _) => return Err(CommandError::Usage("modify <order_id> <price> <amount>")),
            ("state", 1) => Self::State(args[0].to_string()),
            ("state", _) => return Err(CommandError::Usage("state <order_id>")),
            ("orderbook", 0 | 1) => Self::Orderbook(owned(0)),
            ("positions", 0 | 1) => Self::Positions(owned(0)),
            ("instruments", 0..=2) => Self::Instruments {
                currency: owned(0),
                kind: owned(1),
            },
            ("instrument", 0 | 1) => Self::Instrument(owned(0)),
            _ => Self::Raw(trimmed.to_string()),
        };
        Ok(command)
    }
}

fn decimal(raw: &str) -> Result<Decimal, CommandError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| CommandError::InvalidNumber(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;

    fn parse(line: &str) -> Result<Command, CommandError> {
        line.parse()
    }

    #[test]
    fn limit_order() {
        assert_eq!(
            parse("buy limit 10 50000.5").unwrap(),
            Command::Order {
                side: "buy".to_string(),
                order_type: "limit".to_string(),
                amount: dec!(10),
                price: Some(dec!(50000.5)),
            }
        );
    }

    #[test]
    fn market_order_without_price() {
        assert_eq!(
            parse("  sell market 0.1 ").unwrap(),
            Command::Order {
                side: "sell".to_string(),
                order_type: "market".to_string(),
                amount: dec!(0.1),
                price: None,
            }
        );
    }

    #[test]
    fn modify_order() {
        assert_eq!(
            parse("modify 123 49000 5").unwrap(),
            Command::Modify {
                order_id: "123".to_string(),
                price: dec!(49000),
                amount: dec!(5),
            }
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    fn empty_lines(line: &str) {
        assert_eq!(parse(line).unwrap(), Command::Empty);
    }

    #[test_case("orderbook", Command::Orderbook(None))]
    #[test_case("orderbook ETH-PERPETUAL", Command::Orderbook(Some("ETH-PERPETUAL".to_string())))]
    #[test_case("positions ETH", Command::Positions(Some("ETH".to_string())))]
    #[test_case("instrument", Command::Instrument(None))]
    #[test_case("orders", Command::Orders)]
    #[test_case("state 42", Command::State("42".to_string()))]
    #[test_case("cancel 42", Command::Cancel("42".to_string()))]
    #[test_case("quit", Command::Quit)]
    #[test_case("connect", Command::Connect)]
    fn simple_commands(line: &str, expected: Command) {
        assert_eq!(parse(line).unwrap(), expected);
    }

    #[test]
    fn instruments_defaults_are_optional() {
        assert_eq!(
            parse("instruments ETH option").unwrap(),
            Command::Instruments {
                currency: Some("ETH".to_string()),
                kind: Some("option".to_string()),
            }
        );
    }

    #[test_case("buy limit" ; "missing amount")]
    #[test_case("cancel" ; "missing id")]
    #[test_case("modify 1 2" ; "missing amount on modify")]
    fn usage_errors(line: &str) {
        assert!(matches!(parse(line), Err(CommandError::Usage(_))));
    }

    #[test]
    fn bad_number() {
        assert_eq!(
            parse("buy limit ten 5").unwrap_err(),
            CommandError::InvalidNumber("ten".to_string())
        );
    }

    #[test]
    fn unknown_line_is_raw() {
        let line = r#"{"jsonrpc":"2.0","id":9,"method":"public/test","params":{}}"#;
        assert_eq!(parse(line).unwrap(), Command::Raw(line.to_string()));
    }
}
