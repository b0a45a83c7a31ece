//! Standard response envelope for both API boundaries: a
//! `{success, data, meta}` success shape and a `{kind, message, retry_hint}`
//! error body, so every client-visible failure carries a stable
//! classification and an explicit signal on whether retrying is sane.

use crate::error::ErrorKind;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Successful response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap `data` as a bare success response with no metadata.
    pub fn ok(data: T) -> Self {
        Self { success: true, data, meta: None }
    }

    /// Wrap `data` with request-id metadata, as middleware attaches.
    pub fn ok_with_meta(data: T, meta: ResponseMeta) -> Self {
        Self { success: true, data, meta: Some(meta) }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Per-response metadata: just a request id and server-side duration,
/// the two fields every handler can fill in without extra bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: String,
    pub duration_ms: u64,
}

/// Uniform error body: a stable `kind`, a human message, and whether the
/// client should retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_hint: bool,
}

impl ApiError {
    /// Build an error body from a crate error kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retry_hint = kind.is_retryable();
        Self { kind, message: message.into(), retry_hint }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Corrupted | ErrorKind::NoSpace | ErrorKind::Fatal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorKind::TransientIO => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(e: crate::error::Error) -> Self {
        ApiError::new(e.kind, e.message)
    }
}
