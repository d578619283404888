//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, histogram};
use relay_auth::Identity;
use relay_core::{open_with_deadline, ChatClient, ChatError, ChatRequest, ConnectionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use super::broker::ConnectionBroker;
use super::connection::{ClientConnection, ConnectionClosed};
use super::protocol::{decode_frame, Inbound, ServerFrame, APOLOGY_TEXT};
use crate::config::ServerConfig;
use crate::metrics::{
    CHAT_CHUNKS_TOTAL, CHAT_DURATION_SECONDS, CHAT_ERRORS_TOTAL, CHAT_REQUESTS_TOTAL,
    WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL,
};

/// How long teardown waits for the writer to flush and send Close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether `next` directly follows `self`. A rejected handshake goes
    /// straight from `Connecting` to `Closed`.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticated | Self::Closed)
                | (Self::Authenticated, Self::Active)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

#[derive(Debug)]
struct StateTracker(SessionState);

impl StateTracker {
    fn advance(&mut self, next: SessionState) {
        if !self.0.can_advance_to(next) {
            warn!(from = self.0.as_str(), to = next.as_str(), "unexpected session transition");
        }
        debug!(from = self.0.as_str(), to = next.as_str(), "session state");
        self.0 = next;
    }
}

/// Shared services a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub broker: Arc<ConnectionBroker>,
    pub chat: Arc<dyn ChatClient>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

/// Run one authenticated session until the client leaves, the connection
/// is pruned, or the server shuts down.
///
/// Inbound frames are handled in arrival order: a chat request is relayed
/// to completion before the next frame is read. All outbound frames go
/// through the connection's queue and are written by a single writer task
/// that also sends heartbeat pings. The connection is unregistered exactly
/// once on the way out. Returns the final state.
#[instrument(
    skip_all,
    fields(conn_id = tracing::field::Empty, user_id = %identity.user_id, remote_addr = ?remote_addr)
)]
pub async fn run_session<W, R, E>(
    ctx: SessionContext,
    identity: Identity,
    remote_addr: Option<SocketAddr>,
    sink: W,
    mut stream: R,
) -> SessionState
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let mut state = StateTracker(SessionState::Authenticated);
    let id = ConnectionId::new();
    let _ = Span::current().record("conn_id", id.as_str());

    let (tx, rx) = mpsc::channel(ctx.config.send_queue_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(
        id,
        identity.user_id.clone(),
        tx,
        &ctx.shutdown,
    ));
    ctx.broker.register(conn.clone());
    state.advance(SessionState::Active);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(username = %identity.username, "client connected");

    let writer = spawn_writer(
        conn.clone(),
        sink,
        rx,
        ctx.config.heartbeat_interval(),
        ctx.config.heartbeat_timeout(),
    );

    loop {
        let next = tokio::select! {
            biased;
            () = conn.closed() => {
                debug!("connection closed locally");
                break;
            }
            next = stream.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                info!(error = %e, "read error");
                break;
            }
            None => {
                debug!("client stream ended");
                break;
            }
        };
        conn.mark_alive();

        let decoded = match &msg {
            Message::Text(text) => decode_frame(text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => decode_frame(text),
                Err(_) => {
                    info!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
        };

        match decoded {
            Ok(Inbound::Ping) => {
                if conn.send_ordered(ServerFrame::pong().encode()).await.is_err() {
                    break;
                }
            }
            Ok(Inbound::Chat(request)) => {
                if relay_chat(&ctx, &conn, &request).await.is_err() {
                    warn!(kind = request.kind(), "write failed while relaying chat reply");
                    break;
                }
            }
            Ok(Inbound::Unknown(kind)) => {
                warn!(kind, "ignoring frame with unknown type");
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
            }
        }
    }

    state.advance(SessionState::Closing);
    let _ = ctx.broker.unregister(&conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("writer did not finish in time");
    }

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(
        duration_secs = conn.age().as_secs(),
        dropped = conn.drop_count(),
        "client disconnected"
    );
    state.advance(SessionState::Closed);
    state.0
}

/// Stream one chat turn back to `conn`.
///
/// Upstream failures, including the request deadline, become a single
/// apology frame and leave the connection open. Only a failed write is
/// returned as an error. The heartbeat does not time the connection out
/// while the reply is in flight.
#[instrument(skip_all, fields(kind = request.kind(), chunks = tracing::field::Empty))]
async fn relay_chat(
    ctx: &SessionContext,
    conn: &ClientConnection,
    request: &ChatRequest,
) -> Result<(), ConnectionClosed> {
    counter!(CHAT_REQUESTS_TOTAL, "kind" => request.kind(), "transport" => "ws").increment(1);
    let _relay = conn.begin_relay();
    let started = Instant::now();
    let cancel = if ctx.config.cancel_on_disconnect {
        conn.close_token()
    } else {
        ctx.shutdown.child_token()
    };

    let mut chunks = 0_u64;
    let outcome = match open_with_deadline(
        ctx.config.request_timeout(),
        request.open(ctx.chat.as_ref(), cancel, &ctx.config.image_prompt),
    )
    .await
    {
        Ok(mut stream) => loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    conn.send_ordered(ServerFrame::text(&chunk).encode()).await?;
                    chunks += 1;
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        },
        Err(e) => Err(e),
    };

    let _ = Span::current().record("chunks", chunks);
    counter!(CHAT_CHUNKS_TOTAL, "transport" => "ws").increment(chunks);
    histogram!(CHAT_DURATION_SECONDS, "transport" => "ws").record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => {
            debug!(chunks, "chat reply complete");
            Ok(())
        }
        Err(ChatError::Cancelled) => {
            debug!(chunks, "chat reply cancelled");
            Ok(())
        }
        Err(e) => {
            counter!(CHAT_ERRORS_TOTAL, "transport" => "ws", "error_kind" => e.error_kind())
                .increment(1);
            warn!(error = %e, chunks, "chat request failed");
            conn.send_ordered(ServerFrame::text(APOLOGY_TEXT).encode()).await
        }
    }
}

fn spawn_writer<W>(
    conn: Arc<ClientConnection>,
    sink: W,
    queue: mpsc::Receiver<Arc<String>>,
    ping_interval: Duration,
    pong_timeout: Duration,
) -> JoinHandle<()>
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    tokio::spawn(write_loop(conn, sink, queue, ping_interval, pong_timeout))
}

/// Sole writer for one socket. Drains the outbound queue, pings on an
/// interval, and sends Close once the connection is closed.
async fn write_loop<W>(
    conn: Arc<ClientConnection>,
    mut sink: W,
    mut queue: mpsc::Receiver<Arc<String>>,
    ping_interval: Duration,
    pong_timeout: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display + Send,
{
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ticker = tokio::time::interval_at(start, ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = conn.closed() => {
                // Frames queued before the close still go out.
                while let Ok(frame) = queue.try_recv() {
                    if sink.send(text_message(&frame)).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(text_message(&frame)).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                if conn.is_stale(pong_timeout) {
                    warn!(timeout = ?pong_timeout, "client unresponsive, disconnecting");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    debug!(error = %e, "ping write failed");
                    break;
                }
            }
        }
    }
    conn.close();
}

fn text_message(frame: &str) -> Message {
    Message::Text(frame.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use relay_core::UserId;
    use relay_llm::{MockCall, MockChatClient, MockReply};

    fn context(chat: Arc<MockChatClient>, config: ServerConfig) -> SessionContext {
        SessionContext {
            broker: Arc::new(ConnectionBroker::new()),
            chat,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    fn identity() -> Identity {
        Identity::new(UserId::from(7_u64), "alice")
    }

    fn client_text(json: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(json.into()))
    }

    /// Feed `frames`, end the client stream, and return every text frame
    /// the server wrote.
    async fn run_frames(ctx: &SessionContext, frames: Vec<Result<Message, axum::Error>>) -> Vec<serde_json::Value> {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let inbound = futures::stream::iter(frames);
        let state = run_session(ctx.clone(), identity(), None, out_tx, inbound).await;
        assert_eq!(state, SessionState::Closed);
        out_rx
            .filter_map(|msg| async move {
                match msg {
                    Message::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
                    _ => None,
                }
            })
            .collect()
            .await
    }

    #[test]
    fn state_transitions() {
        use SessionState::*;
        assert!(Connecting.can_advance_to(Authenticated));
        assert!(Connecting.can_advance_to(Closed));
        assert!(Authenticated.can_advance_to(Active));
        assert!(Active.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));
        assert!(!Connecting.can_advance_to(Active));
        assert!(!Active.can_advance_to(Closed));
        assert!(!Closed.can_advance_to(Active));
    }

    #[tokio::test]
    async fn ping_gets_pong_without_broker() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat.clone(), ServerConfig::default());

        let frames = run_frames(&ctx, vec![client_text(r#"{"type":"ping"}"#)]).await;

        assert_eq!(frames, vec![serde_json::json!({"type": "pong", "content": ""})]);
        assert_eq!(ctx.broker.broadcast_count(), 0);
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_on_same_connection() {
        let chat = Arc::new(MockChatClient::scripted([MockReply::chunks(["Hel", "lo"])]));
        let ctx = context(chat.clone(), ServerConfig::default());

        let frames = run_frames(&ctx, vec![client_text(r#"{"type":"text","content":"hi"}"#)]).await;

        let contents: Vec<_> = frames.iter().map(|f| f["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["Hel", "lo"]);
        assert!(frames.iter().all(|f| f["type"] == "text"));
        assert_eq!(chat.calls(), vec![MockCall::Text("hi".into())]);
        assert_eq!(ctx.broker.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn image_prefix_is_stripped_before_upstream() {
        let chat = Arc::new(MockChatClient::default());
        let mut config = ServerConfig::default();
        config.image_prompt = "what is this".into();
        let ctx = context(chat.clone(), config);

        let _ = run_frames(
            &ctx,
            vec![client_text(r#"{"type":"image","content":"data:image/jpeg;base64,AAAA"}"#)],
        )
        .await;

        assert_eq!(
            chat.calls(),
            vec![MockCall::Image {
                image: "AAAA".into(),
                prompt: "what is this".into()
            }]
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_sends_one_apology_and_keeps_serving() {
        let chat = Arc::new(MockChatClient::scripted([
            MockReply::FailAfter {
                chunks: vec!["par".into()],
                error: ChatError::StreamInterrupted("reset".into()),
            },
            MockReply::chunks(["ok"]),
        ]));
        let ctx = context(chat.clone(), ServerConfig::default());

        let frames = run_frames(
            &ctx,
            vec![
                client_text(r#"{"type":"text","content":"one"}"#),
                client_text(r#"{"type":"text","content":"two"}"#),
            ],
        )
        .await;

        let contents: Vec<_> = frames.iter().map(|f| f["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["par", APOLOGY_TEXT, "ok"]);
        assert_eq!(chat.call_count(), 2);
    }

    #[tokio::test]
    async fn open_failure_sends_apology() {
        let chat = Arc::new(MockChatClient::always(MockReply::Error(ChatError::from_status(
            500,
            "boom".into(),
        ))));
        let ctx = context(chat, ServerConfig::default());

        let frames = run_frames(&ctx, vec![client_text(r#"{"type":"text","content":"hi"}"#)]).await;

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], APOLOGY_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_sends_apology() {
        let chat = Arc::new(MockChatClient::always(MockReply::Stall(vec!["slow".into()])));
        let mut config = ServerConfig::default();
        config.request_timeout_secs = 2;
        let ctx = context(chat, config);

        let frames = run_frames(&ctx, vec![client_text(r#"{"type":"text","content":"hi"}"#)]).await;

        let contents: Vec<_> = frames.iter().map(|f| f["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["slow", APOLOGY_TEXT]);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_ignored() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat, ServerConfig::default());

        let frames = run_frames(
            &ctx,
            vec![
                client_text(r#"{"type":"typing","content":""}"#),
                client_text("{not json"),
                Ok(Message::Binary(br#"{"type":"ping"}"#.to_vec().into())),
            ],
        )
        .await;

        assert_eq!(frames, vec![serde_json::json!({"type": "pong", "content": ""})]);
    }

    #[tokio::test]
    async fn close_frame_ends_session_and_unregisters() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat.clone(), ServerConfig::default());

        let frames = run_frames(
            &ctx,
            vec![
                Ok(Message::Close(None)),
                client_text(r#"{"type":"text","content":"never read"}"#),
            ],
        )
        .await;

        assert!(frames.is_empty());
        assert_eq!(chat.call_count(), 0);
        assert_eq!(ctx.broker.count_all(), 0);
        assert_eq!(ctx.broker.user_count(), 0);
    }

    #[tokio::test]
    async fn session_unregisters_only_its_own_connection() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat, ServerConfig::default());
        let (other, _rx) = crate::websocket::connection::test_connection(7_u64, 4);
        ctx.broker.register(other.clone());

        let _ = run_frames(&ctx, vec![client_text(r#"{"type":"ping"}"#)]).await;

        assert_eq!(ctx.broker.count_for_user(&UserId::from(7_u64)), 1);
        assert!(ctx.broker.contains(other.user_id(), other.id()));
        assert!(!other.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_live_session() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat, ServerConfig::default());
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let session = tokio::spawn(run_session(ctx.clone(), identity(), None, out_tx, in_rx));
        while ctx.broker.count_all() == 0 {
            tokio::task::yield_now().await;
        }

        let user = UserId::from(7_u64);
        let message = relay_core::Message::text("from phone", relay_core::Sender::Client, user.clone());
        assert_eq!(ctx.broker.broadcast(&message, &user), 1);

        let Some(Message::Text(text)) = out_rx.next().await else {
            panic!("expected a text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame["content"], "from phone");

        drop(in_tx);
        assert_eq!(session.await.unwrap(), SessionState::Closed);
        assert_eq!(ctx.broker.count_all(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_session() {
        let chat = Arc::new(MockChatClient::default());
        let ctx = context(chat, ServerConfig::default());
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let session = tokio::spawn(run_session(ctx.clone(), identity(), None, out_tx, in_rx));
        while ctx.broker.count_all() == 0 {
            tokio::task::yield_now().await;
        }
        ctx.shutdown.cancel();

        assert_eq!(session.await.unwrap(), SessionState::Closed);
        let sent: Vec<_> = out_rx.collect().await;
        assert!(matches!(sent.last(), Some(Message::Close(None))));
        assert_eq!(ctx.broker.count_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_dropped_by_heartbeat() {
        let chat = Arc::new(MockChatClient::default());
        let mut config = ServerConfig::default();
        config.heartbeat_interval_secs = 1;
        config.heartbeat_timeout_secs = 3;
        let ctx = context(chat, config);
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let state = run_session(ctx.clone(), identity(), None, out_tx, in_rx).await;

        assert_eq!(state, SessionState::Closed);
        let sent: Vec<_> = out_rx.collect().await;
        assert!(sent.iter().any(|m| matches!(m, Message::Ping(_))));
        assert!(matches!(sent.last(), Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_outlives_heartbeat_timeout() {
        let chat = Arc::new(MockChatClient::always(MockReply::Delayed {
            delay: Duration::from_secs(6),
            reply: Box::new(MockReply::chunks(["late"])),
        }));
        let mut config = ServerConfig::default();
        config.heartbeat_interval_secs = 1;
        config.heartbeat_timeout_secs = 3;
        config.request_timeout_secs = 10;
        let ctx = context(chat, config);
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        in_tx.unbounded_send(client_text(r#"{"type":"text","content":"hi"}"#)).unwrap();

        let session = tokio::spawn(run_session(ctx.clone(), identity(), None, out_tx, in_rx));

        let text = loop {
            match out_rx.next().await {
                Some(Message::Text(text)) => break text,
                Some(Message::Ping(_)) => continue,
                other => panic!("connection ended before the reply: {other:?}"),
            }
        };
        let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame["content"], "late");
        assert_eq!(ctx.broker.count_all(), 1);

        drop(in_tx);
        assert_eq!(session.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_reply_when_configured() {
        let chat = Arc::new(MockChatClient::always(MockReply::Stall(vec!["partial".into()])));
        let mut config = ServerConfig::default();
        config.cancel_on_disconnect = true;
        config.heartbeat_interval_secs = 1;
        let ctx = context(chat.clone(), config);
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        in_tx.unbounded_send(client_text(r#"{"type":"text","content":"hi"}"#)).unwrap();

        let session = tokio::spawn(run_session(ctx.clone(), identity(), None, out_tx, in_rx));

        let Some(Message::Text(text)) = out_rx.next().await else {
            panic!("expected the first chunk");
        };
        assert!(text.as_str().contains("partial"));
        // The socket goes away: every later write fails.
        out_rx.close();

        assert_eq!(session.await.unwrap(), SessionState::Closed);
        assert_eq!(chat.cancelled_count(), 1);
        let rest: Vec<_> = out_rx.collect().await;
        assert!(!rest
            .iter()
            .any(|m| matches!(m, Message::Text(t) if t.as_str().contains(APOLOGY_TEXT))));
        assert_eq!(ctx.broker.count_all(), 0);
    }
}
