#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Deribit Bridge - Exchange Feed Multiplexer and Order Gateway
//!
//! Keeps one WebSocket connection to Deribit and shares it with any number
//! of local WebSocket clients, and sends authenticated trading requests
//! through a single serialized worker.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Routing and order types with no I/O
//!   - `subscription`: Session ids and the fan-out registry
//!   - `streaming`: Channel names and local client requests
//!   - `order`: Order validation and parameter composition
//!
//! - **Application**: Ports and services
//!   - `ports`: Handler traits for the connector and broker, outbound ports
//!   - `services`: `Router` and `Manager`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `deribit`: WebSocket connector, trading pipeline, HTTP transport
//!   - `broker`: Local WebSocket server and session registry
//!   - `config`, `telemetry`, `metrics`, `health`
//!
//! # Data Flow
//!
//! ```text
//!                 subscribe_orderbook / subscribe_position
//! Client 1 ──┐   ─────────────────────────────────────────►
//! Client 2 ──┼──► Broker ──► Router ──► Connector ◄──► Deribit WS
//! Client N ──┘   ◄───────────────────────────────────────── book.* / user.position.*
//!
//! Commands ──► Pipeline (FIFO worker, bearer token) ──► Deribit HTTP API
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Routing and order types with no external dependencies.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::order::{OrderError, OrderRequest, OrderSide, OrderType};
pub use domain::streaming::{ClientRequest, ClientRequestError, classify_channel};
pub use domain::subscription::{SessionId, SubscriptionKind, SubscriptionRegistry};

// Ports and services
pub use application::ports::{
    BrokerHandler, ConnectorHandler, RpcTransport, SessionDirectory, TransportError, UpstreamPort,
};
pub use application::services::{Manager, ManagerError, RouteError, Router};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError, EnvSource};

// Deribit adapters
pub use infrastructure::deribit::{
    CloseOutcome, Connector, ConnectorError, ConnectorState, Credentials, HttpTransport,
    PendingResponse, Pipeline, PipelineError, PipelineSettings,
};

// Broker
pub use infrastructure::broker::{BrokerError, BrokerServer, BrokerSettings, SessionRegistry, WireFormat};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
