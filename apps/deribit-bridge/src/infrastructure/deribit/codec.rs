//! Inbound Frame Codec
//!
//! Sorts exchange frames into control-plane acknowledgments and
//! subscription events. A frame with an `id` is always an acknowledgment,
//! even if it also looks like an event.

use serde_json::Value;

use super::messages::RpcError;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not valid JSON.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON but not an object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Response to one of our requests.
    Ack {
        /// Echoed request id.
        id: Value,
        /// Error reported by the exchange, if any.
        error: Option<RpcError>,
    },
    /// Subscription notification.
    Event {
        /// Channel name.
        channel: String,
        /// Event payload.
        data: Value,
    },
    /// Anything else (heartbeats, test requests).
    Other(Value),
}

/// JSON codec for the exchange WebSocket.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object.
    pub fn decode(&self, text: &str) -> Result<InboundMessage, CodecError> {
        let value: Value = serde_json::from_str(text)?;

        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(CodecError::InvalidFormat(format!(
                    "expected object, got {}",
                    json_kind(&other)
                )));
            }
        };

        if let Some(id) = object.remove("id") {
            let error = object.get("error").map(RpcError::from_value);
            return Ok(InboundMessage::Ack { id, error });
        }

        if let Some(params) = object.get("params")
            && let Some(channel) = params.get("channel").and_then(Value::as_str)
            && let Some(data) = params.get("data")
        {
            return Ok(InboundMessage::Event {
                channel: channel.to_string(),
                data: data.clone(),
            });
        }

        Ok(InboundMessage::Other(Value::Object(object)))
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
