use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KgError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient: {0}")]
    Transient(String),

    #[error("Index schema broken ({0}) — run a full rebuild")]
    Schema(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl IntoResponse for KgError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            KgError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            KgError::AlreadyExists(_) => (StatusCode::CONFLICT, self.to_string()),
            KgError::Invalid(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            KgError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            KgError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            KgError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            KgError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            KgError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type KgResult<T> = Result<T, KgError>;
