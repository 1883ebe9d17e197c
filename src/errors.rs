use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Request-shape errors caught before any work is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Credential failures reported by the auth gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Could not validate credentials")]
    Unauthenticated,
    #[error("Token has expired")]
    Expired,
    #[error("Token has been revoked")]
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFoundError {
    #[error("Corpus {0} not found")]
    CorpusNotFound(i64),
}

/// Broker and client-connection failures seen by the notification gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Broker unavailable")]
    BrokerUnavailable,
    #[error("Client connection dropped")]
    ConnectionDropped,
}

/// Failures inside a running task. Only ever surfaced as a FAILED event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    WorkerFailure(String),
    #[error("Cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Why the worker pool refused a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// Everything the submission endpoint can answer with instead of a task id.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

impl From<DispatchError> for SubmitError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(e) => SubmitError::Validation(e),
            DispatchError::ShuttingDown => SubmitError::ShuttingDown,
        }
    }
}

/// Errors returned by the account and corpus handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Username already registered")]
    UsernameTaken,
    #[error("Incorrect username or password")]
    BadCredentials,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),
    #[error("Background job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub detail: String,
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated => "Unauthenticated",
            AuthError::Expired => "Expired",
            AuthError::Revoked => "Revoked",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.reason(),
            detail: self.to_string(),
        };
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(body),
        )
            .into_response()
    }
}

impl SubmitError {
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::Validation(ValidationError::UnsupportedAlgorithm(_)) => {
                "UnsupportedAlgorithm"
            }
            SubmitError::NotFound(NotFoundError::CorpusNotFound(_)) => "CorpusNotFound",
            SubmitError::Store(_) => "Internal",
            SubmitError::ShuttingDown => "ShuttingDown",
        }
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
            SubmitError::NotFound(_) => StatusCode::NOT_FOUND,
            SubmitError::Store(e) => {
                tracing::error!("Submission failed on store access: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.reason(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            ApiError::UsernameTaken => (StatusCode::CONFLICT, "UsernameTaken"),
            ApiError::BadCredentials => (StatusCode::UNAUTHORIZED, "BadCredentials"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::Store(e) => {
                tracing::error!("Request failed on store access: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal")
            }
            ApiError::Hashing(_) | ApiError::Join(_) => {
                tracing::error!("Request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal")
            }
        };
        let body = ErrorBody {
            error: reason,
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: match self {
                TransportError::BrokerUnavailable => "BrokerUnavailable",
                TransportError::ConnectionDropped => "ConnectionDropped",
            },
            detail: self.to_string(),
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
