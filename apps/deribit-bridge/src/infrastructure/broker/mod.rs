//! Local Broker Adapters
//!
//! WebSocket server that local subscribers connect to, the per-session
//! write queues, and the registry of live sessions.

pub mod registry;
pub mod server;
pub mod session;

pub use registry::SessionRegistry;
pub use server::{BrokerError, BrokerServer, BrokerSettings, MAX_MESSAGE_SIZE};
pub use session::{DEFAULT_SEND_QUEUE_CAPACITY, Session, WireFormat};
