use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::upload_service::UploadError;
use crate::storage::StorageError;

/// A lightweight wrapper for general errors that keeps the message local.
///
/// Handlers never build one directly; protocol and storage errors convert
/// through the `From` impls below, which pin the HTTP status.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Map protocol errors onto HTTP statuses.
///
/// Missing sessions are 404, closed sessions and part conflicts are 409,
/// malformed input is 400, and an unreachable backend surfaces as 502 so
/// clients know to retry rather than give up.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionClosed { .. } => StatusCode::CONFLICT,
            UploadError::PartMismatch { .. } => StatusCode::CONFLICT,
            UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::BackendUnavailable(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            UploadError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            UploadError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

/// Storage errors reached directly (the in-process backend routes).
impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::UnknownTransaction { .. } => StatusCode::NOT_FOUND,
            StorageError::PartRejected { .. } => StatusCode::BAD_REQUEST,
            StorageError::Unavailable(_) => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, err.to_string())
    }
}
