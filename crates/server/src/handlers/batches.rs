//! Batch handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{owner_from_headers, ws_path};
use crate::handlers::uploads::build_session;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use drivex_core::BatchId;
use drivex_core::upload::{
    BatchFileEntry, CancelBatchResponse, InitiateBatchRequest, InitiateBatchResponse,
};
use drivex_metadata::models::{UploadBatchRow, UploadSessionRow};
use time::OffsetDateTime;

/// Maximum number of files in one batch.
const MAX_BATCH_FILES: usize = 1000;

/// POST /batch/initiate - Create a batch and one pending session per file.
pub async fn initiate_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateBatchRequest>,
) -> ApiResult<(StatusCode, Json<InitiateBatchResponse>)> {
    let owner = owner_from_headers(&headers)?;

    if request.files.is_empty() {
        return Err(ApiError::BadRequest("batch has no files".to_string()));
    }
    if request.files.len() > MAX_BATCH_FILES {
        return Err(ApiError::BadRequest(format!(
            "batch exceeds {MAX_BATCH_FILES} files"
        )));
    }

    let batch_id = BatchId::new();
    // Validate every file before writing anything.
    let sessions = request
        .files
        .iter()
        .map(|file| build_session(&owner, file, Some(batch_id)))
        .collect::<ApiResult<Vec<_>>>()?;

    state
        .metadata
        .create_batch(&UploadBatchRow {
            batch_id: *batch_id.as_uuid(),
            owner_id: owner.as_str().to_string(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await?;

    let mut files = Vec::with_capacity(sessions.len());
    for session in &sessions {
        state
            .metadata
            .create_session(&UploadSessionRow::from_session(session)?)
            .await?;
        files.push(BatchFileEntry {
            file_id: session.file_id.to_string(),
            file_name: session.file_name.clone(),
            ws_path: ws_path(session.file_id),
        });
    }

    tracing::info!(
        batch_id = %batch_id,
        owner_id = %owner,
        files = files.len(),
        "upload batch created"
    );

    Ok((
        StatusCode::CREATED,
        Json(InitiateBatchResponse {
            batch_id: batch_id.to_string(),
            files,
        }),
    ))
}

/// POST /batch/cancel/{batch_id} - Cancel every non-terminal upload in a batch.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<CancelBatchResponse>> {
    let batch_id = BatchId::parse(&batch_id)?;
    let cancelled = state
        .metadata
        .cancel_batch(*batch_id.as_uuid(), OffsetDateTime::now_utc())
        .await?;

    tracing::info!(batch_id = %batch_id, cancelled, "batch cancellation requested");

    Ok(Json(CancelBatchResponse {
        batch_id: batch_id.to_string(),
        cancelled,
    }))
}
