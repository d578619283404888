use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::data_url::strip_data_url_prefix;
use crate::errors::ChatError;

/// Lazily produced, finite sequence of text deltas for one chat turn.
///
/// The first `Err` item is terminal: producers end the stream after it.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Prompt used for image turns when the client sent none.
pub const DEFAULT_IMAGE_PROMPT: &str = "Please describe this image.";

/// A streaming chat-completion backend.
///
/// Both calls resolve once the upstream has accepted the request (or
/// refused it); deltas then arrive through the returned stream.
/// Cancelling `cancel` ends the stream promptly and releases the
/// upstream connection.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn model(&self) -> &str;

    async fn chat_text(
        &self,
        cancel: CancellationToken,
        content: &str,
    ) -> Result<ChunkStream, ChatError>;

    /// `image` is the raw base64 payload, without any data-URL header.
    async fn chat_image(
        &self,
        cancel: CancellationToken,
        image: &str,
        prompt: &str,
    ) -> Result<ChunkStream, ChatError>;
}

/// One user turn, as decoded from either the socket or the HTTP surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatRequest {
    Text(String),
    Image {
        payload: String,
        prompt: Option<String>,
    },
}

impl ChatRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Build an image turn; a leading data-URL header on `content` is dropped.
    pub fn image(content: &str, prompt: Option<String>) -> Self {
        Self::Image {
            payload: strip_data_url_prefix(content).to_owned(),
            prompt: prompt.filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image { .. } => "image",
        }
    }

    /// Issue this turn against `client`.
    pub async fn open(
        &self,
        client: &dyn ChatClient,
        cancel: CancellationToken,
        default_prompt: &str,
    ) -> Result<ChunkStream, ChatError> {
        match self {
            Self::Text(content) => client.chat_text(cancel, content).await,
            Self::Image { payload, prompt } => {
                let prompt = prompt.as_deref().unwrap_or(default_prompt);
                client.chat_image(cancel, payload, prompt).await
            }
        }
    }
}

/// Await `open` and the resulting stream under a single deadline.
///
/// The deadline covers the initial response as well as every chunk read.
/// On expiry the in-flight stream is dropped and one
/// [`ChatError::Timeout`] is yielded.
pub async fn open_with_deadline<F>(timeout: Duration, open: F) -> Result<ChunkStream, ChatError>
where
    F: Future<Output = Result<ChunkStream, ChatError>>,
{
    let deadline = Instant::now() + timeout;
    let stream = tokio::time::timeout_at(deadline, open)
        .await
        .map_err(|_| ChatError::Timeout(timeout))??;
    Ok(until_deadline(stream, deadline, timeout))
}

fn until_deadline(stream: ChunkStream, deadline: Instant, timeout: Duration) -> ChunkStream {
    Box::pin(futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((Err(ChatError::Timeout(timeout)), None)),
        }
    }))
}
