use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::errors::{ApiError, StoreError};
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub id: i64,
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusSummary {
    pub id: i64,
    pub name: String,
}

pub trait CorpusStore: Send + Sync {
    fn fetch_corpus(&self, corpus_id: i64) -> Result<Option<Corpus>, StoreError>;
}

#[derive(Deserialize)]
pub struct UploadCorpusRequest {
    pub corpus_name: String,
    pub text: String,
}

#[derive(Serialize)]
pub struct UploadCorpusResponse {
    pub corpus_id: i64,
    pub message: String,
}

#[derive(Serialize)]
pub struct CorpusListResponse {
    pub corpuses: Vec<CorpusSummary>,
}

pub async fn upload_corpus(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<UploadCorpusRequest>,
) -> Result<Json<UploadCorpusResponse>, ApiError> {
    if req.corpus_name.trim().is_empty() {
        return Err(ApiError::BadRequest("corpus_name is required".to_string()));
    }

    let corpus_id = state.db.create_corpus(req.corpus_name.trim(), &req.text)?;
    tracing::info!(
        "User {} uploaded corpus {} ({} bytes)",
        user.user_id,
        corpus_id,
        req.text.len()
    );

    Ok(Json(UploadCorpusResponse {
        corpus_id,
        message: "Corpus uploaded successfully".to_string(),
    }))
}

pub async fn list_corpuses(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> Result<Json<CorpusListResponse>, ApiError> {
    let corpuses = state.db.list_corpora()?;
    Ok(Json(CorpusListResponse { corpuses }))
}
