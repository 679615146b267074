//! Upload session types and lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for one file transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid file ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FileId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier grouping several files uploaded together.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid batch ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the requesting user, used as the per-user concurrency key.
///
/// Authentication happens outside this system; the value is opaque here.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Owner used when the auth layer supplied no identity.
    pub const ANONYMOUS: &'static str = "anonymous";

    /// Create an owner ID, rejecting blank values.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidId("owner ID is empty".to_string()));
        }
        if trimmed.len() > 256 {
            return Err(crate::Error::InvalidId("owner ID too long".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted upload status.
///
/// `pending -> uploading -> {completed | failed | cancelled}`. `pending` may
/// also move directly to `failed` or `cancelled`. Terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Session created, bytes not yet flowing.
    Pending,
    /// Admitted and transferring bytes.
    Uploading,
    /// All bytes acknowledged by the destination.
    Completed,
    /// Transfer failed or was interrupted.
    Failed,
    /// Cancelled through the out-of-band endpoint.
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
        )
    }

    /// Validate a transition, returning the target status.
    pub fn transition_to(&self, next: UploadStatus) -> crate::Result<UploadStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the secondary durability copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// No backup configured or not yet scheduled.
    None,
    Pending,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// One file transfer attempt as persisted by the status store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: FileId,
    pub batch_id: Option<BatchId>,
    pub owner_id: OwnerId,
    pub file_name: String,
    pub content_type: String,
    /// Total expected size in bytes, declared by the client.
    pub declared_size: u64,
    /// Bytes acknowledged by the destination so far. Never decreases.
    pub bytes_transferred: u64,
    pub status: UploadStatus,
    /// Retrieval reference returned by the destination on completion.
    pub retrieval_ref: Option<String>,
    /// Machine-readable failure code (`chunk_upload_failed`, `interrupted`, ...).
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub backup_status: BackupStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

impl UploadSession {
    /// Create a new pending session.
    pub fn new(
        owner_id: OwnerId,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        declared_size: u64,
        batch_id: Option<BatchId>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            file_id: FileId::new(),
            batch_id,
            owner_id,
            file_name: file_name.into(),
            content_type: content_type.into(),
            declared_size,
            bytes_transferred: 0,
            status: UploadStatus::Pending,
            retrieval_ref: None,
            error_code: None,
            error_detail: None,
            backup_status: BackupStatus::None,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        }
    }

    /// Percentage of the declared size acknowledged so far.
    pub fn percent_complete(&self) -> u8 {
        crate::progress::percent(self.bytes_transferred, self.declared_size)
    }
}

/// Request body for starting one upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateUploadRequest {
    pub file_name: String,
    /// Declared size in bytes.
    pub size: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// Response from starting one upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateUploadResponse {
    pub file_id: String,
    /// Path of the WebSocket endpoint carrying the bytes.
    pub ws_path: String,
}

/// Request body for starting a batch of uploads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateBatchRequest {
    pub files: Vec<InitiateUploadRequest>,
}

/// One file entry in a batch response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchFileEntry {
    pub file_id: String,
    pub file_name: String,
    pub ws_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateBatchResponse {
    pub batch_id: String,
    pub files: Vec<BatchFileEntry>,
}

/// Response from the cancellation endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelUploadResponse {
    pub file_id: String,
    pub status: UploadStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub cancelled_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelBatchResponse {
    pub batch_id: String,
    /// Number of sessions actually moved to `cancelled`.
    pub cancelled: u64,
}

/// Response from querying a session's persisted state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub file_id: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub declared_size: u64,
    pub bytes_transferred: u64,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub backup_status: BackupStatus,
}

impl From<&UploadSession> for UploadStatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            file_id: session.file_id.to_string(),
            file_name: session.file_name.clone(),
            status: session.status,
            declared_size: session.declared_size,
            bytes_transferred: session.bytes_transferred,
            percent: session.percent_complete(),
            retrieval_ref: session.retrieval_ref.clone(),
            error_code: session.error_code.clone(),
            backup_status: session.backup_status,
        }
    }
}
