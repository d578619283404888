//! # SSE Parser
//!
//! Server-Sent Events framing for chat-completion streams:
//! - Line buffering from chunked responses (`\n` or `\r\n`)
//! - Event assembly: `data:` lines up to a blank line form one event,
//!   multiple `data:` lines are joined with `\n`
//! - Comments (`:`) and other fields (`event:`, `id:`, `retry:`) are ignored
//! - The `[DONE]` sentinel surfaces as [`SseFrame::Done`]
//! - A pending event is flushed when the byte stream ends
//!
//! Transport read errors are surfaced once as
//! [`ChatError::StreamInterrupted`], after which the stream ends.

use std::fmt::Display;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use relay_core::ChatError;
use tracing::warn;

const DONE_SENTINEL: &str = "[DONE]";

/// One complete SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseFrame {
    /// The event's `data` payload.
    Data(String),
    /// The upstream's end-of-stream sentinel.
    Done,
}

struct ParserState<S> {
    stream: S,
    buffer: BytesMut,
    data: Vec<String>,
    finished: bool,
}

impl<S> ParserState<S> {
    /// Feed one line; returns a frame when the line completes an event.
    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_owned());
        }
        None
    }

    fn take_event(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if payload.trim() == DONE_SENTINEL {
            Some(SseFrame::Done)
        } else {
            Some(SseFrame::Data(payload))
        }
    }
}

/// Parse SSE events from a byte stream.
pub fn parse_sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, ChatError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = ParserState {
        stream: byte_stream,
        buffer: BytesMut::with_capacity(8192),
        data: Vec::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }

        loop {
            if let Some(newline_pos) = st.buffer.iter().position(|&b| b == b'\n') {
                let mut line_bytes = st.buffer.split_to(newline_pos + 1);
                line_bytes.truncate(line_bytes.len() - 1);
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.truncate(line_bytes.len() - 1);
                }

                let Ok(line) = std::str::from_utf8(&line_bytes) else {
                    warn!(len = line_bytes.len(), "skipping SSE line with invalid UTF-8");
                    continue;
                };
                if let Some(frame) = st.feed_line(line) {
                    return Some((Ok(frame), st));
                }
                continue;
            }

            match st.stream.next().await {
                Some(Ok(chunk)) => st.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    warn!(error = %e, "SSE stream read error");
                    st.finished = true;
                    return Some((Err(ChatError::StreamInterrupted(e.to_string())), st));
                }
                None => {
                    st.finished = true;
                    if !st.buffer.is_empty() {
                        let rest = st.buffer.split();
                        if let Ok(line) = std::str::from_utf8(&rest) {
                            let line = line.trim_end_matches('\r');
                            if let Some(frame) = st.feed_line(line) {
                                return Some((Ok(frame), st));
                            }
                        }
                    }
                    let frame = st.take_event()?;
                    return Some((Ok(frame), st));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn collect(chunks: Vec<Result<Bytes, String>>) -> Vec<Result<SseFrame, ChatError>> {
        parse_sse_events(futures::stream::iter(chunks)).collect().await
    }

    fn data(s: &str) -> Result<SseFrame, ChatError> {
        Ok(SseFrame::Data(s.into()))
    }

    #[tokio::test]
    async fn single_event() {
        let frames = collect(vec![Ok(Bytes::from("data: {\"a\":1}\n\n"))]).await;
        assert_eq!(frames, vec![data("{\"a\":1}")]);
    }

    #[tokio::test]
    async fn done_sentinel_surfaces() {
        let frames = collect(vec![Ok(Bytes::from("data: {\"a\":1}\n\ndata: [DONE]\n\n"))]).await;
        assert_eq!(frames, vec![data("{\"a\":1}"), Ok(SseFrame::Done)]);
    }

    #[tokio::test]
    async fn event_split_across_chunks() {
        let frames = collect(vec![
            Ok(Bytes::from("data: {\"par")),
            Ok(Bytes::from("tial\":true}\r\n")),
            Ok(Bytes::from("\r\n")),
        ])
        .await;
        assert_eq!(frames, vec![data("{\"partial\":true}")]);
    }

    #[tokio::test]
    async fn multi_line_data_joined() {
        let frames = collect(vec![Ok(Bytes::from("data: first\ndata:second\n\n"))]).await;
        assert_eq!(frames, vec![data("first\nsecond")]);
    }

    #[tokio::test]
    async fn comments_and_other_fields_ignored() {
        let frames = collect(vec![Ok(Bytes::from(
            ": keep-alive\n\nevent: message\nid: 7\ndata: x\n\nretry: 10\n\n",
        ))])
        .await;
        assert_eq!(frames, vec![data("x")]);
    }

    #[tokio::test]
    async fn trailing_event_flushed_at_eof() {
        let frames = collect(vec![Ok(Bytes::from("data: tail"))]).await;
        assert_eq!(frames, vec![data("tail")]);
    }

    #[tokio::test]
    async fn read_error_is_terminal() {
        let frames = collect(vec![
            Ok(Bytes::from("data: one\n\n")),
            Err("connection reset".into()),
            Ok(Bytes::from("data: never\n\n")),
        ])
        .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], data("one"));
        assert!(matches!(&frames[1], Err(ChatError::StreamInterrupted(m)) if m.contains("reset")));
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        assert!(collect(vec![]).await.is_empty());
    }
}
