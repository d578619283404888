//! Scripted [`ChatClient`] for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{ChatClient, ChatError, ChunkStream};
use tokio_util::sync::CancellationToken;

/// What the mock does for one call.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Yield these chunks, then end normally.
    Chunks(Vec<String>),
    /// Yield `chunks`, then `error`.
    FailAfter { chunks: Vec<String>, error: ChatError },
    /// Refuse the request before any chunk.
    Error(ChatError),
    /// Yield `chunks`, then wait until cancelled.
    Stall(Vec<String>),
    /// Wait `delay` before acting on the inner reply.
    Delayed { delay: Duration, reply: Box<MockReply> },
}

impl MockReply {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Chunks(chunks.into_iter().map(Into::into).collect())
    }
}

enum Terminal {
    End,
    Fail(ChatError),
    Stall,
}

/// One recorded invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Text(String),
    Image { image: String, prompt: String },
}

/// Replays queued replies in order, then the fallback reply forever.
pub struct MockChatClient {
    model: String,
    replies: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    calls: Mutex<Vec<MockCall>>,
    /// Replies that ended because their token was cancelled.
    cancelled: Arc<AtomicUsize>,
}

impl MockChatClient {
    /// Every call yields `reply`.
    pub fn always(reply: MockReply) -> Self {
        Self {
            model: "mock".into(),
            replies: Mutex::new(VecDeque::new()),
            fallback: reply,
            calls: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls consume `replies` in order; once exhausted they yield no chunks.
    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let client = Self::always(MockReply::Chunks(Vec::new()));
        client.replies.lock().extend(replies);
        client
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// How many replies observed cancellation.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn respond(&self, cancel: CancellationToken, call: MockCall) -> Result<ChunkStream, ChatError> {
        self.calls.lock().push(call);
        let mut reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let (chunks, terminal) = loop {
            match reply {
                MockReply::Delayed { delay, reply: inner } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            let _ = self.cancelled.fetch_add(1, Ordering::SeqCst);
                            return Err(ChatError::Cancelled);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    reply = *inner;
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Chunks(chunks) => break (chunks, Terminal::End),
                MockReply::FailAfter { chunks, error } => break (chunks, Terminal::Fail(error)),
                MockReply::Stall(chunks) => break (chunks, Terminal::Stall),
            }
        };

        let cancelled = self.cancelled.clone();
        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                if cancel.is_cancelled() {
                    let _ = cancelled.fetch_add(1, Ordering::SeqCst);
                    yield Err(ChatError::Cancelled);
                    return;
                }
                yield Ok(chunk);
            }
            match terminal {
                Terminal::End => {}
                Terminal::Fail(error) => {
                    yield Err(error);
                }
                Terminal::Stall => {
                    cancel.cancelled().await;
                    let _ = cancelled.fetch_add(1, Ordering::SeqCst);
                    yield Err(ChatError::Cancelled);
                }
            }
        }))
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::scripted(Vec::new())
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat_text(&self, cancel: CancellationToken, content: &str) -> Result<ChunkStream, ChatError> {
        self.respond(cancel, MockCall::Text(content.to_owned())).await
    }

    async fn chat_image(
        &self,
        cancel: CancellationToken,
        image: &str,
        prompt: &str,
    ) -> Result<ChunkStream, ChatError> {
        let call = MockCall::Image {
            image: image.to_owned(),
            prompt: prompt.to_owned(),
        };
        self.respond(cancel, call).await
    }
}
