//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the ports defined in the application layer,
//! plus process-level concerns (configuration, telemetry, health).

/// Deribit adapters (WebSocket connector, trading pipeline, HTTP transport).
pub mod deribit;

/// Local WebSocket broker for downstream subscribers.
pub mod broker;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
