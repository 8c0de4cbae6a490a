//! Wire error representation for the control-plane API.

use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{BackendOp, VolumeError};

/// Machine-readable error code carried in the `error` and `code` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ValidationError,
    InvalidBackend,
    AlreadyExists,
    NotFound,
    VolumeInUse,
    StageFailed,
    UnstageFailed,
    PublishFailed,
    UnpublishFailed,
    NotReady,
    InternalError,
    /// A code this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::ValidationError => "validation_error",
            Self::InvalidBackend => "invalid_backend",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::VolumeInUse => "volume_in_use",
            Self::StageFailed => "stage_failed",
            Self::UnstageFailed => "unstage_failed",
            Self::PublishFailed => "publish_failed",
            Self::UnpublishFailed => "unpublish_failed",
            Self::NotReady => "not_ready",
            Self::InternalError => "internal_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    pub code: ErrorCode,
}

/// A request-scoped failure with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, message)
    }
}

impl From<VolumeError> for ApiError {
    fn from(e: VolumeError) -> Self {
        let (status, code) = match &e {
            VolumeError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
            VolumeError::AlreadyExists(_) => (StatusCode::CONFLICT, ErrorCode::AlreadyExists),
            VolumeError::Conflict(_) => (StatusCode::CONFLICT, ErrorCode::VolumeInUse),
            VolumeError::Validation(_) => (StatusCode::BAD_REQUEST, ErrorCode::ValidationError),
            VolumeError::BackendNotFound(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidBackend),
            VolumeError::BackendOperationFailed { op, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                match op {
                    BackendOp::Stage => ErrorCode::StageFailed,
                    BackendOp::Unstage => ErrorCode::UnstageFailed,
                    BackendOp::Publish => ErrorCode::PublishFailed,
                    BackendOp::Unpublish => ErrorCode::UnpublishFailed,
                },
            ),
            VolumeError::AlreadyRegistered(_) | VolumeError::Store(_) | VolumeError::Internal(_) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError)
            }
        };
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
