//! Bearer credential extractors and the account endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::Json;
use relay_auth::{bearer_token, AuthError, Identity, JwtAuthority};
use relay_store::{NewUser, StoreError, UserRecord, UserStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::error::ApiError;
use crate::server::AppState;

/// The caller of an authenticated HTTP endpoint.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = header_token(parts).ok_or(AuthError::MissingToken)?;
        let identity = state.validator.validate(&token)?;
        Ok(Self(identity))
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Upgrade credentials and peer address, captured before the handshake.
///
/// Browsers cannot set headers on a WebSocket handshake, so `?token=` is
/// read first and `Authorization` second.
#[derive(Debug, Clone)]
pub struct WsHandshake {
    pub token: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

impl<S: Send + Sync> FromRequestParts<S> for WsHandshake {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let query_token = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|t| !t.trim().is_empty());
        let token = query_token.or_else(|| header_token(parts));
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self { token, remote_addr })
    }
}

fn header_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned)
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub code: u16,
    pub token: String,
}

/// POST /api/auth/refresh: re-sign a still-valid token with a fresh expiry.
pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let issuer = state
        .issuer
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("token refresh is not configured".into()))?;
    let token = bearer_token(&body.token).ok_or(AuthError::MissingToken)?;
    match issuer.refresh(token) {
        Ok(token) => Ok(Json(RefreshResponse { code: 200, token })),
        Err(AuthError::Issue(e)) => Err(ApiError::Internal(e)),
        Err(e) => Err(e.into()),
    }
}

const USERNAME_CHARS: std::ops::RangeInclusive<usize> = 3..=50;
const MAX_EMAIL_LEN: usize = 100;
const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub code: u16,
    pub message: &'static str,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
}

fn validate_registration(body: &RegisterBody) -> Result<(), ApiError> {
    if !USERNAME_CHARS.contains(&body.username.chars().count()) {
        return Err(ApiError::BadRequest("username must be 3 to 50 characters".into()));
    }
    if !looks_like_email(&body.email) {
        return Err(ApiError::BadRequest("email is invalid".into()));
    }
    if body.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ApiError::BadRequest("password must be at least 6 characters".into()));
    }
    Ok(())
}

fn looks_like_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN
        && !email.contains(char::is_whitespace)
        && email.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        })
}

fn accounts(state: &AppState) -> Result<(Arc<dyn UserStore>, Arc<JwtAuthority>), ApiError> {
    match (&state.users, &state.issuer) {
        (Some(users), Some(issuer)) => Ok((users.clone(), issuer.clone())),
        _ => Err(ApiError::Unavailable("accounts are not configured".into())),
    }
}

fn issue_for(issuer: &JwtAuthority, user: &UserRecord) -> Result<String, ApiError> {
    issuer
        .issue(&Identity::new(user.id.to_string(), user.username.as_str()))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// POST /api/auth/register
#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<AccountResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    validate_registration(&body)?;
    let (users, issuer) = accounts(&state)?;
    let passwords = state.passwords;

    // bcrypt is CPU-bound.
    let user = tokio::task::spawn_blocking(move || -> Result<UserRecord, ApiError> {
        let hash = passwords
            .hash(&body.password)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let new_user = NewUser {
            username: &body.username,
            email: &body.email,
            password_hash: &hash,
        };
        users.create_user(&new_user).map_err(|e| match e {
            StoreError::Conflict(field) => ApiError::BadRequest(format!("{field} already exists")),
            other => {
                error!(error = %other, "failed to create user");
                ApiError::Internal("failed to create user".into())
            }
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("account task failed: {e}")))??;

    let token = issue_for(&issuer, &user)?;
    info!(user_id = user.id, username = %user.username, "user registered");
    Ok(Json(AccountResponse {
        code: 200,
        message: "registered",
        token,
        user: None,
    }))
}

/// POST /api/auth/login
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Json<AccountResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if body.username.is_empty() || body.password.is_empty() {
        return Err(ApiError::BadRequest("username and password are required".into()));
    }
    let (users, issuer) = accounts(&state)?;
    let passwords = state.passwords;

    let user = tokio::task::spawn_blocking(move || -> Result<UserRecord, ApiError> {
        let found = users.find_by_username(&body.username).map_err(|e| {
            error!(error = %e, "failed to load user");
            ApiError::Internal("failed to load user".into())
        })?;
        match found {
            Some(user) if passwords.verify(&body.password, &user.password_hash) => Ok(user),
            _ => Err(ApiError::from(AuthError::InvalidCredentials)),
        }
    })
    .await
    .map_err(|e| ApiError::Internal(format!("account task failed: {e}")))??;

    let token = issue_for(&issuer, &user)?;
    info!(user_id = user.id, "user logged in");
    Ok(Json(AccountResponse {
        code: 200,
        message: "logged in",
        token,
        user: Some(user),
    }))
}
