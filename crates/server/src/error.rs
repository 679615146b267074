//! API and upload error types.

use crate::concurrency::AdmissionDenied;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use drivex_core::ByteRange;
use drivex_storage::StorageError;
use serde::Serialize;

/// Why an upload session ended without success.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("insufficient resources: {0}")]
    AdmissionDenied(#[from] AdmissionDenied),

    #[error("could not open destination session: {0}")]
    DestinationSession(#[source] StorageError),

    #[error("chunk upload failed for {range} after {attempts} attempts: {reason}")]
    ChunkUploadFailed {
        range: ByteRange,
        attempts: u32,
        reason: String,
    },

    #[error("upload cancelled")]
    Cancelled,

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Code persisted as the session's `error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(_) => "admission_denied",
            Self::DestinationSession(_) => "destination_session",
            Self::ChunkUploadFailed { .. } => "chunk_upload_failed",
            Self::Cancelled => "cancelled",
            Self::ClientDisconnected => "client_disconnected",
            Self::Protocol(_) => "protocol_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<drivex_metadata::MetadataError> for UploadError {
    fn from(e: drivex_metadata::MetadataError) -> Self {
        Self::Internal(format!("status store: {e}"))
    }
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] drivex_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] drivex_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(drivex_metadata::MetadataError::InvalidStateTransition { .. }) => {
                "invalid_state"
            }
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        use drivex_metadata::MetadataError;
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                // Terminal sessions cannot be cancelled again.
                MetadataError::InvalidStateTransition { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
