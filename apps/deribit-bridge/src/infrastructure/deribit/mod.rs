//! Deribit Adapters
//!
//! - **Connector**: WebSocket client for subscriptions and events
//! - **Pipeline**: serialized, authenticated trading API calls over HTTP
//! - **Messages / Codec**: JSON-RPC envelopes and inbound frame sorting

pub mod auth;
pub mod codec;
pub mod connector;
pub mod http;
pub mod messages;
pub mod pipeline;

pub use auth::{AuthError, Credentials, TokenState};
pub use codec::{CodecError, InboundMessage, JsonCodec};
pub use connector::{CloseOutcome, Connector, ConnectorError, ConnectorState, is_shutdown_noise};
pub use http::HttpTransport;
pub use messages::{RpcError, RpcRequest, SubscribeScope, subscribe_request};
pub use pipeline::{
    ApiRequest, PendingResponse, Pipeline, PipelineError, PipelineSettings, PipelineStatsSnapshot,
};
