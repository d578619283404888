//! WebSocket session handling: per-connection state, the broker, the
//! frame protocol, and the session relay.

pub mod broker;
pub mod connection;
pub mod protocol;
pub mod session;
