//! # relay-llm
//!
//! Streaming chat-completions client for OpenAI-compatible endpoints.
//!
//! - [`sse`]: Server-Sent Events framing over a byte stream
//! - [`client`]: [`OpenAiCompatClient`], the production [`relay_core::ChatClient`]
//! - [`mock`]: [`MockChatClient`] with scripted replies

pub mod client;
pub mod mock;
pub mod sse;
pub mod types;

pub use client::{completions_endpoint, ChatClientConfig, OpenAiCompatClient};
pub use mock::{MockCall, MockChatClient, MockReply};
pub use sse::{parse_sse_events, SseFrame};
