//! Proxy engine error taxonomy (§7). Narrower than `crate::error::AppError`:
//! every variant here is specific to the hot-path request-forwarding flow.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub key_id: Option<i64>,
    pub status_code: Option<u16>,
    pub error_message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing or unknown proxy key")]
    Unauthorized,
    #[error("group {0} not found")]
    GroupNotFound(String),
    #[error("group {0} has no active upstream keys")]
    NoActiveKeys(String),
    /// Upstream responded with a status outside the retry/success set, or
    /// retries were exhausted; `attempts` carries the per-attempt debug
    /// record mandated by §4.7 step 5.
    #[error("upstream error {status}")]
    UpstreamTerminal { status: u16, body: Value, attempts: Vec<AttemptRecord> },
    #[error("store error: {0}")]
    StoreBackend(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct AttemptsBody {
    error: &'static str,
    attempts: Vec<AttemptRecordBody>,
}

#[derive(Debug, Serialize)]
struct AttemptRecordBody {
    attempt: u32,
    key_id: Option<i64>,
    status_code: Option<u16>,
    error_message: String,
}

impl From<&AttemptRecord> for AttemptRecordBody {
    fn from(r: &AttemptRecord) -> Self {
        Self { attempt: r.attempt, key_id: r.key_id, status_code: r.status_code, error_message: r.error_message.clone() }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response()
            }
            ProxyError::GroupNotFound(name) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "group_not_found", "group": name})),
            )
                .into_response(),
            ProxyError::NoActiveKeys(name) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "no_active_keys", "group": name})),
            )
                .into_response(),
            ProxyError::UpstreamTerminal { status, body, attempts } => {
                let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                if attempts.is_empty() {
                    (status_code, Json(body)).into_response()
                } else {
                    let payload = AttemptsBody {
                        error: "retry_exhausted",
                        attempts: attempts.iter().map(AttemptRecordBody::from).collect(),
                    };
                    (status_code, Json(payload)).into_response()
                }
            }
            ProxyError::StoreBackend(msg) => {
                crate::logger::error("proxy", &format!("store backend error: {msg}"));
                (StatusCode::BAD_GATEWAY, Json(serde_json::json!({"error": "store_backend"}))).into_response()
            }
            ProxyError::Internal(msg) => {
                crate::logger::error("proxy", &format!("internal error: {msg}"));
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "internal"}))).into_response()
            }
        }
    }
}

impl From<crate::store::StoreError> for ProxyError {
    fn from(err: crate::store::StoreError) -> Self {
        ProxyError::StoreBackend(err.to_string())
    }
}
