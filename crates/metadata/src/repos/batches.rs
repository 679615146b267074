//! Upload batch repository.

use crate::error::MetadataResult;
use crate::models::UploadBatchRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for batch operations.
#[async_trait]
pub trait BatchRepo: Send + Sync {
    async fn create_batch(&self, batch: &UploadBatchRow) -> MetadataResult<()>;

    async fn get_batch(&self, batch_id: Uuid) -> MetadataResult<Option<UploadBatchRow>>;

    /// Cancel every non-terminal session in the batch.
    ///
    /// Returns the number of sessions actually cancelled. Errors with
    /// `NotFound` if the batch does not exist.
    async fn cancel_batch(&self, batch_id: Uuid, at: OffsetDateTime) -> MetadataResult<u64>;
}
