//! Application Services
//!
//! - `Router`: subscription requests upstream, event fan-out downstream
//! - `Manager`: owns the connector, broker and router and their lifecycle

pub mod manager;
pub mod router;

pub use manager::{Manager, ManagerError};
pub use router::{RouteError, Router};
