//! # relay-server
//!
//! Axum HTTP + WebSocket server that relays messages between a user's
//! devices and streams AI replies back to the device that asked.
//!
//! - [`websocket::broker`]: per-user connection registry and fan-out
//! - [`websocket::session`]: one client's lifecycle from upgrade to close
//! - [`http`]: message submission, history, AI chat, token refresh
//! - [`server`]: router, middleware, and listener

pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;
pub use websocket::broker::ConnectionBroker;
