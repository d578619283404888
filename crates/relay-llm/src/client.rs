//! OpenAI-compatible streaming chat client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use relay_core::data_url::jpeg_data_url;
use relay_core::{ApiKey, ChatClient, ChatError, ChunkStream};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::sse::{parse_sse_events, SseFrame};
use crate::types::{
    CompletionChunk, CompletionRequest, ContentPart, ImageUrl, MessageContent, RequestMessage,
    Thinking,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// e.g. `https://api.openai.com/v1`. A missing scheme means `https://`.
    pub base_url: String,
    pub api_key: ApiKey,
    pub model: String,
    /// Forwarded as `{"thinking": {"type": ...}}` when set.
    pub thinking: Option<String>,
}

/// `{base}/chat/completions`, with `https://` assumed and trailing `/` dropped.
pub fn completions_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/chat/completions")
    } else {
        format!("https://{base}/chat/completions")
    }
}

/// Streams `choices[0].delta.content` from a `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: ApiKey,
    model: String,
    thinking: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChatError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self::with_http_client(config, http))
    }

    /// Use a preconfigured `reqwest::Client` (shared pools, proxies).
    pub fn with_http_client(config: ChatClientConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: completions_endpoint(&config.base_url),
            api_key: config.api_key,
            model: config.model,
            thinking: config.thinking.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request<'a>(&'a self, content: MessageContent<'a>) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: vec![RequestMessage {
                role: "user",
                content,
            }],
            stream: true,
            thinking: self.thinking.as_deref().map(|kind| Thinking { kind }),
        }
    }

    async fn send(
        &self,
        cancel: CancellationToken,
        body: &CompletionRequest<'_>,
    ) -> Result<ChunkStream, ChatError> {
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(body)
            .build()
            .map_err(|e| ChatError::InvalidRequest(e.to_string()))?;

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            result = self.http.execute(request) => {
                result.map_err(|e| ChatError::Network(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chat request rejected"
            );
            return Err(ChatError::from_status(status.as_u16(), body_text));
        }
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat stream opened"
        );

        let frames = parse_sse_events(Box::pin(response.bytes_stream()));
        Ok(content_deltas(frames, cancel))
    }
}

/// Map SSE frames to non-empty content deltas.
///
/// Ends on `[DONE]` or end-of-data. Unparsable frames are skipped.
/// A read error or cancellation yields one `Err` and ends the stream,
/// dropping the transport.
fn content_deltas<S>(frames: S, cancel: CancellationToken) -> ChunkStream
where
    S: Stream<Item = Result<SseFrame, ChatError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut frames = Box::pin(frames);
        let mut chunks = 0_usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                frame = frames.next() => Some(frame),
            };
            match next {
                None => {
                    debug!(chunks, "chat stream cancelled");
                    yield Err(ChatError::Cancelled);
                    break;
                }
                Some(None) | Some(Some(Ok(SseFrame::Done))) => {
                    debug!(chunks, "chat stream finished");
                    break;
                }
                Some(Some(Ok(SseFrame::Data(data)))) => {
                    match serde_json::from_str::<CompletionChunk>(&data) {
                        Ok(chunk) => {
                            if let Some(content) = chunk.into_content().filter(|c| !c.is_empty()) {
                                chunks += 1;
                                yield Ok(content);
                            }
                        }
                        Err(e) => warn!(error = %e, data = %data, "skipping malformed chat chunk"),
                    }
                }
                Some(Some(Err(e))) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, kind = "text", len = content.len()))]
    async fn chat_text(
        &self,
        cancel: CancellationToken,
        content: &str,
    ) -> Result<ChunkStream, ChatError> {
        let body = self.build_request(MessageContent::Text(content));
        self.send(cancel, &body).await
    }

    #[instrument(skip_all, fields(model = %self.model, kind = "image", len = image.len()))]
    async fn chat_image(
        &self,
        cancel: CancellationToken,
        image: &str,
        prompt: &str,
    ) -> Result<ChunkStream, ChatError> {
        let body = self.build_request(MessageContent::Parts(vec![
            ContentPart::Text { text: prompt },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: jpeg_data_url(image),
                },
            },
        ]));
        self.send(cancel, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, thinking: Option<&str>) -> OpenAiCompatClient {
        OpenAiCompatClient::new(ChatClientConfig {
            base_url: format!("{}/v1/", server.uri()),
            api_key: ApiKey::new("sk-test"),
            model: "test-model".into(),
            thinking: thinking.map(String::from),
        })
        .unwrap()
    }

    fn sse(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body.to_string())
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<String, ChatError>> {
        stream.collect().await
    }

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            completions_endpoint("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            completions_endpoint("ark.example.com/api/v3/"),
            "https://ark.example.com/api/v3/chat/completions"
        );
        assert_eq!(
            completions_endpoint("http://localhost:9000"),
            "http://localhost:9000/chat/completions"
        );
    }

    #[tokio::test]
    async fn single_delta_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(sse(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let stream = client.chat_text(CancellationToken::new(), "hello").await.unwrap();
        assert_eq!(collect(stream).await, vec![Ok("Hi".to_string())]);
    }

    #[tokio::test]
    async fn text_request_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("accept", "text/event-stream"))
            .and(header("cache-control", "no-cache"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}],
                "thinking": {"type": "enabled"}
            })))
            .respond_with(sse(&format!("{}data: [DONE]\n\n", delta("ok"))))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("enabled"));
        let stream = client.chat_text(CancellationToken::new(), "hello").await.unwrap();
        assert_eq!(collect(stream).await, vec![Ok("ok".to_string())]);
    }

    #[tokio::test]
    async fn image_request_embeds_data_url_and_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "what is it"},
                        {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}}
                    ]
                }]
            })))
            .respond_with(sse(&delta("a cat")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let stream = client
            .chat_image(CancellationToken::new(), "AAAA", "what is it")
            .await
            .unwrap();
        assert_eq!(collect(stream).await, vec![Ok("a cat".to_string())]);
    }

    #[tokio::test]
    async fn chunks_keep_order_and_skip_empty_and_malformed() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}data: not json\n\n: ping\n\n{}data: {{\"choices\":[]}}\n\n",
            delta("Hel"),
            delta(""),
            delta("lo"),
        );
        Mock::given(method("POST"))
            .respond_with(sse(&body))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let stream = client.chat_text(CancellationToken::new(), "x").await.unwrap();
        assert_eq!(
            collect(stream).await,
            vec![Ok("Hel".to_string()), Ok("lo".to_string())]
        );
    }

    #[tokio::test]
    async fn frames_after_done_are_ignored() {
        let server = MockServer::start().await;
        let body = format!("{}data: [DONE]\n\n{}", delta("one"), delta("two"));
        Mock::given(method("POST"))
            .respond_with(sse(&body))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let stream = client.chat_text(CancellationToken::new(), "x").await.unwrap();
        assert_eq!(collect(stream).await, vec![Ok("one".to_string())]);
    }

    #[tokio::test]
    async fn server_error_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.chat_text(CancellationToken::new(), "x").await.err().unwrap();
        assert_eq!(
            err,
            ChatError::Status {
                status: 500,
                body: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn unauthorized_status_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.chat_text(CancellationToken::new(), "x").await.err().unwrap();
        assert_eq!(err, ChatError::AuthenticationFailed("bad key".into()));
    }

    #[tokio::test]
    async fn cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&delta("late")).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.chat_text(cancel, "x").await.err().unwrap();
        assert_eq!(err, ChatError::Cancelled);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let client = OpenAiCompatClient::new(ChatClientConfig {
            base_url: "http://127.0.0.1:1".into(),
            api_key: ApiKey::new("k"),
            model: "m".into(),
            thinking: None,
        })
        .unwrap();
        let err = client.chat_text(CancellationToken::new(), "x").await.err().unwrap();
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_yields_cancelled() {
        let frames = futures::stream::iter(vec![Ok(SseFrame::Data(
            "{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}".into(),
        ))])
        .chain(futures::stream::pending());
        let cancel = CancellationToken::new();
        let mut stream = content_deltas(frames, cancel.clone());

        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        cancel.cancel();
        assert_eq!(stream.next().await, Some(Err(ChatError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn read_error_ends_stream_with_error() {
        let frames = futures::stream::iter(vec![
            Ok(SseFrame::Data("{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}".into())),
            Err(ChatError::StreamInterrupted("reset".into())),
        ]);
        let stream = content_deltas(frames, CancellationToken::new());
        assert_eq!(
            collect(stream).await,
            vec![
                Ok("a".to_string()),
                Err(ChatError::StreamInterrupted("reset".into()))
            ]
        );
    }

    #[test]
    fn blank_thinking_is_dropped() {
        let client = OpenAiCompatClient::new(ChatClientConfig {
            base_url: "api.example.com".into(),
            api_key: ApiKey::new("k"),
            model: "m".into(),
            thinking: Some("  ".into()),
        })
        .unwrap();
        assert!(client.build_request(MessageContent::Text("x")).thinking.is_none());
        assert_eq!(client.endpoint(), "https://api.example.com/chat/completions");
    }
}
