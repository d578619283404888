//! HTTP endpoints beside the WebSocket upgrade.

pub mod auth;
pub mod chat;
pub mod error;
pub mod messages;

pub use auth::{AuthUser, WsHandshake};
pub use error::ApiError;
