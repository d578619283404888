//! Shared vocabulary for the relay: identities, the message model, and the
//! streaming chat contract consumed by both the socket and HTTP paths.

pub mod chat;
pub mod data_url;
pub mod errors;
pub mod ids;
pub mod message;
pub mod security;

pub use chat::{open_with_deadline, ChatClient, ChatRequest, ChunkStream, DEFAULT_IMAGE_PROMPT};
pub use errors::ChatError;
pub use ids::{ConnectionId, RequestId, UserId};
pub use message::{Message, MessageType, Sender};
pub use security::ApiKey;
