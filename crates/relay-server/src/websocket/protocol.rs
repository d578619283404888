//! Duplex frame format.
//!
//! Inbound: `{"type": "text"|"image"|"ping", "content": "...", "prompt"?: "..."}`.
//! Outbound: `{"type": "text"|"pong", "content": "..."}`.

use std::sync::Arc;

use relay_core::ChatRequest;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Sent in place of the rest of a reply when the upstream call fails.
pub const APOLOGY_TEXT: &str =
    "Sorry, the AI service is temporarily unavailable. Please try again later.";

#[derive(Debug, Clone, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    prompt: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ping,
    Chat(ChatRequest),
    /// Well-formed frame with a `type` this server does not handle.
    Unknown(String),
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Inbound, serde_json::Error> {
    let frame: ClientFrame = serde_json::from_str(text)?;
    Ok(match frame.kind.as_str() {
        "ping" => Inbound::Ping,
        "text" => Inbound::Chat(ChatRequest::text(frame.content)),
        "image" => Inbound::Chat(ChatRequest::image(&frame.content, frame.prompt)),
        _ => Inbound::Unknown(frame.kind),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFrameKind {
    Text,
    Pong,
}

/// An outbound frame written directly to one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame<'a> {
    #[serde(rename = "type")]
    pub kind: ServerFrameKind,
    pub content: &'a str,
}

impl<'a> ServerFrame<'a> {
    pub fn text(content: &'a str) -> Self {
        Self {
            kind: ServerFrameKind::Text,
            content,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: ServerFrameKind::Pong,
            content: "",
        }
    }

    /// Serialize for the connection's outbound queue.
    pub fn encode(&self) -> Arc<String> {
        Arc::new(serde_json::to_string(self).unwrap_or_else(|e| {
            error!(error = %e, "failed to serialize server frame");
            String::new()
        }))
    }
}
