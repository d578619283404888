//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Request};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_auth::{AuthError, Identity, JwtAuthority, PasswordHasher, TokenValidator};
use relay_core::{ChatClient, RequestId};
use relay_store::{MessageStore, UserStore};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId as HeaderRequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse, StatusResponse};
use crate::http::{self, ApiError, WsHandshake};
use crate::metrics::WS_AUTH_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broker::ConnectionBroker;
use crate::websocket::session::{run_session, SessionContext, SessionState};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ConnectionBroker>,
    pub chat: Arc<dyn ChatClient>,
    pub validator: Arc<dyn TokenValidator>,
    /// Present when the server can mint tokens (enables `/api/auth/refresh`).
    pub issuer: Option<Arc<JwtAuthority>>,
    pub store: Arc<dyn MessageStore>,
    /// Present when accounts are enabled (`/api/auth/register`, `/api/auth/login`).
    pub users: Option<Arc<dyn UserStore>>,
    pub passwords: PasswordHasher,
    pub config: Arc<ServerConfig>,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    fn session_context(&self) -> SessionContext {
        SessionContext {
            broker: self.broker.clone(),
            chat: self.chat.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.token(),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    pub fn new(
        config: ServerConfig,
        chat: Arc<dyn ChatClient>,
        validator: Arc<dyn TokenValidator>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            state: AppState {
                broker: Arc::new(ConnectionBroker::new()),
                chat,
                validator,
                issuer: None,
                store,
                users: None,
                passwords: PasswordHasher::default(),
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: Arc<JwtAuthority>) -> Self {
        self.state.issuer = Some(issuer);
        self
    }

    #[must_use]
    pub fn with_users(mut self, users: Arc<dyn UserStore>, passwords: PasswordHasher) -> Self {
        self.state.users = Some(users);
        self.state.passwords = passwords;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let max_body = self.state.config.max_message_size;
        Router::new()
            .route("/", get(root_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/status", get(status_handler))
            .route("/api/message", post(http::messages::submit_text))
            .route("/api/image", post(http::messages::submit_image))
            .route("/api/messages", get(http::messages::list_messages))
            .route("/api/ai/chat", post(http::chat::chat))
            .route("/api/auth/register", post(http::auth::register))
            .route("/api/auth/login", post(http::auth::login))
            .route("/api/auth/refresh", post(http::auth::refresh_token))
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(max_body))
            .layer(CorsLayer::permissive())
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRelayRequestId))
                    .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        info_span!(
                            "http",
                            method = %req.method(),
                            path = %req.uri().path(),
                            request_id,
                        )
                    }))
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Bind and serve until shutdown. Returns the bound address and the
    /// serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let shutdown = self.state.shutdown.token();
        info!(%addr, model = self.state.chat.model(), "relay server listening");

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server exited with error");
            }
        });
        Ok((addr, handle))
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.state.broker
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// Stamps each request with a UUID v7 id unless the client sent one.
#[derive(Clone, Copy, Debug, Default)]
struct MakeRelayRequestId;

impl MakeRequestId for MakeRelayRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<HeaderRequestId> {
        HeaderValue::from_str(RequestId::new().as_str())
            .ok()
            .map(HeaderRequestId::new)
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.broker.count_all()))
}

/// GET /api/status
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::new(state.broker.count_all()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("metrics recorder not installed".into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    code: u16,
    service: &'static str,
    version: &'static str,
    websocket: &'static str,
}

/// GET /: upgrades when asked to, otherwise describes the service.
async fn root_handler(
    State(state): State<AppState>,
    handshake: WsHandshake,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => upgrade_session(state, handshake, Ok(upgrade)),
        Err(_) => Json(ServiceInfo {
            code: 200,
            service: "relay",
            version: env!("CARGO_PKG_VERSION"),
            websocket: "/ws",
        })
        .into_response(),
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    handshake: WsHandshake,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade_session(state, handshake, upgrade)
}

/// Authenticate before the handshake completes; a bad token never
/// reaches the broker.
fn upgrade_session(
    state: AppState,
    handshake: WsHandshake,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(state.validator.as_ref(), handshake.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            counter!(WS_AUTH_REJECTED_TOTAL).increment(1);
            info!(
                error = %e,
                remote_addr = ?handshake.remote_addr,
                from = SessionState::Connecting.as_str(),
                to = SessionState::Closed.as_str(),
                "websocket handshake rejected"
            );
            return ApiError::from(e).into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let ctx = state.session_context();
    let remote_addr = handshake.remote_addr;
    upgrade
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let _ = run_session(ctx, identity, remote_addr, sink, stream).await;
        })
}

fn authenticate(validator: &dyn TokenValidator, token: Option<&str>) -> Result<Identity, AuthError> {
    let token = token.ok_or(AuthError::MissingToken)?;
    validator.validate(token)
}
