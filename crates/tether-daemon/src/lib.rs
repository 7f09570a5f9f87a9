//! tether-daemon library: exposes the daemon components for testing.

pub mod connection;
pub mod frame;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ListenerId};
pub use frame::{CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, WireFrame};
