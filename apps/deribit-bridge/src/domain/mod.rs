//! Domain Layer - Routing and order types with no I/O.
//!
//! Everything here is plain data and pure functions, shared by the
//! broker, the connector and the request pipeline.

/// Channel classification and local client requests.
pub mod streaming;

/// Subscription entries and the fan-out registry.
pub mod subscription;

/// Order validation and parameter composition.
pub mod order;
