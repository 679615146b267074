//! Upload control plane handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{owner_from_headers, ws_path};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use drivex_core::upload::{
    CancelUploadResponse, InitiateUploadRequest, InitiateUploadResponse, UploadStatusResponse,
};
use drivex_core::{BatchId, FileId, OwnerId, UploadSession, UploadStatus};
use drivex_metadata::models::UploadSessionRow;
use time::OffsetDateTime;

/// Maximum accepted file name length, in bytes.
const MAX_FILE_NAME_LEN: usize = 1024;

/// Validate an initiate request and build the pending session.
pub(crate) fn build_session(
    owner: &OwnerId,
    request: &InitiateUploadRequest,
    batch_id: Option<BatchId>,
) -> ApiResult<UploadSession> {
    let file_name = request.file_name.trim();
    if file_name.is_empty() {
        return Err(ApiError::BadRequest("file_name must not be empty".to_string()));
    }
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "file_name exceeds {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if i64::try_from(request.size).is_err() {
        return Err(ApiError::BadRequest(format!(
            "declared size {} is too large",
            request.size
        )));
    }
    let content_type = match request.content_type.trim() {
        "" => "application/octet-stream",
        ct => ct,
    };

    Ok(UploadSession::new(
        owner.clone(),
        file_name,
        content_type,
        request.size,
        batch_id,
    ))
}

/// POST /upload/initiate - Create a pending upload session.
pub async fn initiate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateUploadRequest>,
) -> ApiResult<(StatusCode, Json<InitiateUploadResponse>)> {
    let owner = owner_from_headers(&headers)?;

    let batch_id = match &request.batch_id {
        Some(raw) => {
            let batch_id = BatchId::parse(raw)?;
            let batch = state
                .metadata
                .get_batch(*batch_id.as_uuid())
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("batch {batch_id}")))?;
            if batch.owner_id != owner.as_str() {
                return Err(ApiError::BadRequest(format!(
                    "batch {batch_id} belongs to another owner"
                )));
            }
            Some(batch_id)
        }
        None => None,
    };

    let session = build_session(&owner, &request, batch_id)?;
    state
        .metadata
        .create_session(&UploadSessionRow::from_session(&session)?)
        .await?;

    tracing::info!(
        file_id = %session.file_id,
        owner_id = %owner,
        size = session.declared_size,
        "upload session created"
    );

    Ok((
        StatusCode::CREATED,
        Json(InitiateUploadResponse {
            file_id: session.file_id.to_string(),
            ws_path: ws_path(session.file_id),
        }),
    ))
}

/// POST /upload/cancel/{file_id} - Cancel a pending or running upload.
///
/// Only flips the persisted status; the running session notices through its
/// watcher or its inline check.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<CancelUploadResponse>> {
    let file_id = FileId::parse(&file_id)?;
    let cancelled_at = OffsetDateTime::now_utc();

    state
        .metadata
        .cancel_session(*file_id.as_uuid(), cancelled_at)
        .await?;

    tracing::info!(file_id = %file_id, "upload cancellation requested");

    Ok(Json(CancelUploadResponse {
        file_id: file_id.to_string(),
        status: UploadStatus::Cancelled,
        cancelled_at,
    }))
}

/// GET /upload/status/{file_id} - Persisted state of one upload.
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let file_id = FileId::parse(&file_id)?;
    let session = state
        .metadata
        .get_session(*file_id.as_uuid())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {file_id}")))?
        .into_session()?;

    Ok(Json(UploadStatusResponse::from(&session)))
}
