//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use axum::http::HeaderMap;
use drivex_core::{FileId, OwnerId};

/// Header carrying the caller identity set by the fronting auth layer.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Resolve the owner of a request.
///
/// Authentication happens upstream; a missing or blank header means the
/// anonymous owner.
pub fn owner_from_headers(headers: &HeaderMap) -> ApiResult<OwnerId> {
    let Some(value) = headers.get(OWNER_HEADER) else {
        return Ok(OwnerId::anonymous());
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{OWNER_HEADER} is not valid UTF-8")))?;
    if value.trim().is_empty() {
        return Ok(OwnerId::anonymous());
    }
    Ok(OwnerId::new(value)?)
}

/// Path of the WebSocket endpoint carrying one file's bytes.
pub fn ws_path(file_id: FileId) -> String {
    format!("/ws/upload/{file_id}")
}
