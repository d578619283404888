//! POST /api/ai/chat: one chat turn, answered as JSON or as an event stream.

use std::convert::Infallible;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::ACCEPT;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use metrics::{counter, histogram};
use relay_core::{open_with_deadline, ChatError, ChatRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::auth::AuthUser;
use super::error::ApiError;
use crate::metrics::{CHAT_CHUNKS_TOTAL, CHAT_DURATION_SECONDS, CHAT_ERRORS_TOTAL, CHAT_REQUESTS_TOTAL};
use crate::server::AppState;
use crate::websocket::protocol::APOLOGY_TEXT;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_kind() -> String {
    "text".into()
}

impl ChatBody {
    fn into_request(self) -> Result<ChatRequest, ApiError> {
        if self.content.trim().is_empty() {
            return Err(ApiError::BadRequest("content is required".into()));
        }
        match self.kind.as_str() {
            "text" => Ok(ChatRequest::text(self.content)),
            "image" => Ok(ChatRequest::image(&self.content, self.prompt)),
            other => Err(ApiError::BadRequest(format!("unsupported type: {other}"))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub code: u16,
    pub content: String,
}

pub async fn chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = body.into_request()?;
    debug!(user_id = %user.user_id, kind = request.kind(), "http chat request");

    if wants_event_stream(&headers) {
        Ok(stream_reply(state, request).into_response())
    } else {
        collect_reply(&state, &request).await.map(IntoResponse::into_response)
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

async fn collect_reply(state: &AppState, request: &ChatRequest) -> Result<Json<ChatResponse>, ApiError> {
    counter!(CHAT_REQUESTS_TOTAL, "kind" => request.kind(), "transport" => "http").increment(1);
    let started = Instant::now();
    let cancel = state.shutdown.child_token();

    let mut content = String::new();
    let mut chunks = 0_u64;
    let outcome = match open_with_deadline(
        state.config.request_timeout(),
        request.open(state.chat.as_ref(), cancel, &state.config.image_prompt),
    )
    .await
    {
        Ok(mut stream) => loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    content.push_str(&chunk);
                    chunks += 1;
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        },
        Err(e) => Err(e),
    };
    counter!(CHAT_CHUNKS_TOTAL, "transport" => "http").increment(chunks);
    histogram!(CHAT_DURATION_SECONDS, "transport" => "http").record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => Ok(Json(ChatResponse { code: 200, content })),
        Err(e) => {
            counter!(CHAT_ERRORS_TOTAL, "transport" => "http", "error_kind" => e.error_kind())
                .increment(1);
            warn!(error = %e, chunks, "chat request failed");
            Err(ApiError::Internal(APOLOGY_TEXT.into()))
        }
    }
}

/// SSE reply: one `data:` event per chunk, an apology event on failure,
/// and no end-of-stream sentinel.
fn stream_reply(
    state: AppState,
    request: ChatRequest,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    counter!(CHAT_REQUESTS_TOTAL, "kind" => request.kind(), "transport" => "sse").increment(1);
    let cancel = state.shutdown.child_token();

    let events = async_stream::stream! {
        let started = Instant::now();
        let mut chunks = 0_u64;
        let opened = open_with_deadline(
            state.config.request_timeout(),
            request.open(state.chat.as_ref(), cancel, &state.config.image_prompt),
        )
        .await;
        let failure = match opened {
            Ok(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        chunks += 1;
                        yield Ok(chunk_event(&chunk));
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            },
            Err(e) => Some(e),
        };
        counter!(CHAT_CHUNKS_TOTAL, "transport" => "sse").increment(chunks);
        histogram!(CHAT_DURATION_SECONDS, "transport" => "sse").record(started.elapsed().as_secs_f64());

        match failure {
            None | Some(ChatError::Cancelled) => {}
            Some(e) => {
                counter!(CHAT_ERRORS_TOTAL, "transport" => "sse", "error_kind" => e.error_kind())
                    .increment(1);
                warn!(error = %e, chunks, "chat stream failed");
                yield Ok(chunk_event(APOLOGY_TEXT));
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Event field values may not carry `\r`; multi-line chunks become
/// multiple `data:` lines.
fn chunk_event(chunk: &str) -> Event {
    if chunk.contains('\r') {
        Event::default().data(chunk.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Event::default().data(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn body(kind: &str, content: &str) -> ChatBody {
        ChatBody {
            kind: kind.into(),
            content: content.into(),
            prompt: None,
        }
    }

    #[test]
    fn body_into_request() {
        assert_eq!(body("text", "hi").into_request().unwrap(), ChatRequest::text("hi"));
        assert_eq!(
            body("image", "data:image/png;base64,QQ==").into_request().unwrap(),
            ChatRequest::Image {
                payload: "QQ==".into(),
                prompt: None
            }
        );
        assert!(matches!(body("audio", "x").into_request(), Err(ApiError::BadRequest(_))));
        assert!(matches!(body("text", "  ").into_request(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn missing_type_defaults_to_text() {
        let parsed: ChatBody = serde_json::from_str(r#"{"content":"hey"}"#).unwrap();
        assert_eq!(parsed.kind, "text");
    }

    #[test]
    fn accept_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_event_stream(&headers));
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(wants_event_stream(&headers));
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream;q=0.9"));
        assert!(wants_event_stream(&headers));
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!wants_event_stream(&headers));
    }
}
