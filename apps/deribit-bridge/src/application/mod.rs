//! Application Layer - Ports and the routing service.
//!
//! The router sits between the upstream connector and the local broker
//! and only talks to them through the ports defined here.

/// Port interfaces for the connector, broker and HTTP transport.
pub mod ports;

/// Application services (event routing).
pub mod services;
