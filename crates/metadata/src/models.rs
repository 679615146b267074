//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use drivex_core::{BackupStatus, BatchId, FileId, OwnerId, UploadSession, UploadStatus};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub file_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub owner_id: String,
    pub file_name: String,
    pub content_type: String,
    pub declared_size: i64,
    pub bytes_transferred: i64,
    pub status: String,
    pub retrieval_ref: Option<String>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub backup_status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub cancelled_at: Option<OffsetDateTime>,
}

impl UploadSessionRow {
    /// Build a row from a domain session.
    pub fn from_session(session: &UploadSession) -> MetadataResult<Self> {
        Ok(Self {
            file_id: *session.file_id.as_uuid(),
            batch_id: session.batch_id.map(|b| *b.as_uuid()),
            owner_id: session.owner_id.as_str().to_string(),
            file_name: session.file_name.clone(),
            content_type: session.content_type.clone(),
            declared_size: to_i64(session.declared_size)?,
            bytes_transferred: to_i64(session.bytes_transferred)?,
            status: session.status.as_str().to_string(),
            retrieval_ref: session.retrieval_ref.clone(),
            error_code: session.error_code.clone(),
            error_detail: session.error_detail.clone(),
            backup_status: session.backup_status.as_str().to_string(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            cancelled_at: session.cancelled_at,
        })
    }

    /// Convert into the domain type, validating enum columns.
    pub fn into_session(self) -> MetadataResult<UploadSession> {
        Ok(UploadSession {
            file_id: FileId::from(self.file_id),
            batch_id: self.batch_id.map(BatchId::from),
            owner_id: OwnerId::new(self.owner_id)?,
            file_name: self.file_name,
            content_type: self.content_type,
            declared_size: to_u64(self.declared_size)?,
            bytes_transferred: to_u64(self.bytes_transferred)?,
            status: UploadStatus::parse(&self.status)?,
            retrieval_ref: self.retrieval_ref,
            error_code: self.error_code,
            error_detail: self.error_detail,
            backup_status: BackupStatus::parse(&self.backup_status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            cancelled_at: self.cancelled_at,
        })
    }
}

/// Batch record grouping several uploads.
#[derive(Debug, Clone, FromRow)]
pub struct UploadBatchRow {
    pub batch_id: Uuid,
    pub owner_id: String,
    pub created_at: OffsetDateTime,
}

/// SQLite integers are signed; sizes beyond `i64::MAX` are rejected.
pub(crate) fn to_i64(value: u64) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("value {value} exceeds i64")))
}

pub(crate) fn to_u64(value: i64) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("negative value {value}")))
}
