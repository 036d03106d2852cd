//! Application-wide error taxonomy (§7), covering everything outside the
//! proxy engine's hot path (which has its own, narrower `proxy::error::ProxyError`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Application-wide error kinds, named by *kind* rather than source type
/// (§7): `Validation`, `Unauthorized`, `ResourceNotFound`, `Internal`, and
/// `StoreBackend` all surface here; `NoActiveKeys`/`UpstreamRetryable`/
/// `UpstreamTerminal`/`KeyRevoked` are proxy-engine-only (`proxy::error`).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                crate::logger::error("server", &format!("database error: {e}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "database operation failed".to_string())
            }
            AppError::Store(e) => {
                crate::logger::error("server", &format!("store error: {e}"));
                (StatusCode::BAD_GATEWAY, "store operation failed".to_string())
            }
            AppError::Io(e) => {
                crate::logger::error("server", &format!("io error: {e}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "io operation failed".to_string())
            }
            AppError::Json(e) => (StatusCode::BAD_REQUEST, format!("malformed json: {e}")),
            AppError::Config(msg) => {
                crate::logger::error("server", &format!("config error: {msg}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration error".to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Internal(msg) => {
                crate::logger::error("server", &format!("internal error: {msg}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: status.as_u16().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
