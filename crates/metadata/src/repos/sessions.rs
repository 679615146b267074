//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::UploadSessionRow;
use async_trait::async_trait;
use drivex_core::{BackupStatus, UploadStatus};
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload session status.
///
/// Every status write is conditional on the current status, so terminal
/// states are final at the storage level.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Create a new session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get a session by file ID.
    async fn get_session(&self, file_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Read only the persisted status.
    async fn get_status(&self, file_id: Uuid) -> MetadataResult<Option<UploadStatus>>;

    /// Move `pending -> uploading`. Returns false if the session was not pending.
    async fn mark_uploading(&self, file_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Raise `bytes_transferred` to `bytes` if it is larger. Never lowers it.
    async fn record_progress(
        &self,
        file_id: Uuid,
        bytes: u64,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Move `uploading -> completed`. Returns false if the session was not uploading.
    async fn complete_session(
        &self,
        file_id: Uuid,
        retrieval_ref: &str,
        bytes: u64,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move a non-terminal session to `failed`. Returns false if already terminal.
    async fn fail_session(
        &self,
        file_id: Uuid,
        error_code: &str,
        error_detail: Option<&str>,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move a non-terminal session to `cancelled`.
    ///
    /// Errors with `NotFound` for unknown sessions and
    /// `InvalidStateTransition` for terminal ones.
    async fn cancel_session(&self, file_id: Uuid, at: OffsetDateTime) -> MetadataResult<()>;

    /// Fail every session left `uploading` by a previous process.
    /// Returns the number of sessions recovered.
    async fn recover_interrupted(&self, at: OffsetDateTime) -> MetadataResult<u64>;

    async fn set_backup_status(
        &self,
        file_id: Uuid,
        status: BackupStatus,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// List the sessions belonging to a batch.
    async fn list_batch_sessions(&self, batch_id: Uuid) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Count sessions per status.
    async fn count_by_status(&self) -> MetadataResult<Vec<(String, u64)>>;
}
