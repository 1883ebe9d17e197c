use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ApiError, AuthError, StoreError};
use crate::AppState;

/// A persisted bearer token as the auth gate needs to see it.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub user_active: bool,
}

pub trait TokenStore: Send + Sync {
    fn find_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError>;
}

/// Turns a presented credential into a user id, or says why it can't.
#[derive(Clone)]
pub struct AuthGate {
    tokens: Arc<dyn TokenStore>,
}

impl AuthGate {
    pub fn new(tokens: Arc<dyn TokenStore>) -> Self {
        Self { tokens }
    }

    pub fn validate(&self, credential: &str) -> Result<i64, AuthError> {
        let record = match self.tokens.find_token(credential) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(AuthError::Unauthenticated),
            Err(e) => {
                tracing::error!("Token lookup failed: {}", e);
                return Err(AuthError::Unauthenticated);
            }
        };

        if !record.is_active {
            return Err(AuthError::Revoked);
        }
        if record.expires_at < Utc::now() {
            return Err(AuthError::Expired);
        }
        if !record.user_active {
            return Err(AuthError::Unauthenticated);
        }
        Ok(record.user_id)
    }
}

/// bcrypt digest in modular crypt format; the salt is embedded in it.
pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}

/// A malformed stored digest never matches.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

// === Request identity ===

/// Caller identity established from `Authorization: Bearer <token>`, or from
/// a `?token=` query parameter for clients that cannot set headers on a
/// WebSocket handshake.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub token: String,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn credential_from(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = credential_from(parts).ok_or(AuthError::Unauthenticated)?;
        match state.auth.validate(&token) {
            Ok(user_id) => Ok(AuthenticatedUser { user_id, token }),
            Err(e) => {
                tracing::warn!("Rejected credential on {}: {}", parts.uri.path(), e);
                Err(e)
            }
        }
    }
}

// === Account handlers ===

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Username and password are required".to_string(),
        ));
    }

    let cost = state.config.password_hash_cost;
    let password = req.password;
    let password_hash =
        tokio::task::spawn_blocking(move || hash_password(&password, cost)).await??;

    match state.db.create_user(username, &password_hash)? {
        Some(id) => {
            tracing::info!("Registered user {} ({})", username, id);
            Ok(Json(UserResponse {
                id,
                username: username.to_string(),
                is_active: true,
            }))
        }
        None => Err(ApiError::UsernameTaken),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .db
        .get_user(req.username.trim())?
        .ok_or(ApiError::BadCredentials)?;

    let password = req.password;
    let password_hash = user.password_hash.clone();
    let matches =
        tokio::task::spawn_blocking(move || verify_password(&password, &password_hash)).await?;
    if !matches {
        return Err(ApiError::BadCredentials);
    }

    if !user.is_active {
        return Err(ApiError::BadRequest("Inactive user".to_string()));
    }

    let access_token = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let expires_at = Utc::now() + chrono::Duration::minutes(state.config.token_ttl_minutes);
    state.db.create_token(&access_token, user.id, expires_at)?;

    tracing::info!("User {} logged in", user.username);
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        expires_at,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<StatusCode, ApiError> {
    state.db.revoke_token(&user.token)?;
    tracing::info!("User {} logged out", user.user_id);
    Ok(StatusCode::NO_CONTENT)
}
