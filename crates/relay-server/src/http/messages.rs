//! Message submission and history endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Query, State};
use axum::Json;
use metrics::counter;
use relay_core::data_url::encode_jpeg_data_url;
use relay_core::{Message, Sender};
use relay_store::StoredMessage;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::auth::AuthUser;
use super::error::ApiError;
use crate::metrics::HTTP_MESSAGES_TOTAL;
use crate::server::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct SubmitText {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub code: u16,
    pub message: &'static str,
    /// Connections the message was delivered to.
    pub delivered: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub code: u16,
    pub messages: Vec<StoredMessage>,
}

/// POST /api/message
#[instrument(skip_all, fields(user_id = %user.user_id))]
pub async fn submit_text(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<SubmitText>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }
    let message = Message::text(body.content, Sender::Client, user.user_id);
    let delivered = persist_and_broadcast(&state, message).await?;
    Ok(Json(SubmitResponse {
        code: 200,
        message: "message sent",
        delivered,
    }))
}

/// POST /api/image (multipart, field `image`)
#[instrument(skip_all, fields(user_id = %user.user_id))]
pub async fn submit_image(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            image = Some(bytes);
            break;
        }
    }
    let bytes = image
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ApiError::BadRequest("image is required".into()))?;

    let message = Message::image(encode_jpeg_data_url(&bytes), Sender::Client, user.user_id);
    let delivered = persist_and_broadcast(&state, message).await?;
    Ok(Json(SubmitResponse {
        code: 200,
        message: "image sent",
        delivered,
    }))
}

/// GET /api/messages?limit=
pub async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || store.list_for_owner(&user.user_id, limit))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(|e| {
            error!(error = %e, "failed to list messages");
            ApiError::Internal("failed to load messages".into())
        })?;
    Ok(Json(HistoryResponse { code: 200, messages }))
}

/// Store first; only a stored message is broadcast.
async fn persist_and_broadcast(state: &AppState, message: Message) -> Result<usize, ApiError> {
    let store = state.store.clone();
    let record = message.clone();
    let stored = tokio::task::spawn_blocking(move || store.create(&record))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(|e| {
            error!(error = %e, "failed to store message");
            ApiError::Internal("failed to store message".into())
        })?;

    counter!(HTTP_MESSAGES_TOTAL, "kind" => message.kind().as_str()).increment(1);
    let delivered = state.broker.broadcast(&message, message.owner());
    info!(id = stored.id, kind = message.kind().as_str(), delivered, "message relayed");
    Ok(delivered)
}
