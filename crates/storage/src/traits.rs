//! Destination trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use drivex_core::ByteRange;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Parameters for opening a resumable-upload session.
#[derive(Clone, Debug)]
pub struct OpenSessionRequest {
    /// Client-facing name of the object.
    pub name: String,
    pub content_type: String,
    /// Total object size in bytes.
    pub total_size: u64,
}

/// Opaque reference to an open resumable-upload session.
///
/// Owned by exactly one upload for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    /// Backend-specific session reference (an ID or a session URL).
    pub reference: String,
    pub total_size: u64,
}

/// Object produced once every byte of a session has been acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedObject {
    /// Retrieval reference handed back to the client.
    pub reference: String,
    pub size: u64,
}

/// Outcome of uploading one byte range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeAck {
    /// Range stored; the object is not complete yet.
    Partial,
    /// Range stored and the object is complete.
    Complete(CompletedObject),
}

/// What a destination supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Whether ranges of one session may be uploaded concurrently and
    /// complete in any order.
    pub out_of_order_ranges: bool,
}

/// A destination offering resumable, range-based uploads.
#[async_trait]
pub trait ResumableStore: Send + Sync {
    /// Open a resumable session for an object of the given size.
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle>;

    /// Upload `data` as byte range `range` of the session's object.
    ///
    /// `data.len()` must equal `range.len()`. An empty range is only valid for
    /// an empty object and completes it.
    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck>;

    /// Stream a completed object back by its retrieval reference.
    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream>;

    fn capabilities(&self) -> StoreCapabilities;

    /// Get the backend name for logging/metrics.
    fn backend_name(&self) -> &'static str;

    /// Check backend health.
    ///
    /// Returns an error if the backend is not reachable or misconfigured.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Check that a range fits its session and matches its payload.
pub fn validate_range(session: &SessionHandle, range: ByteRange, len: usize) -> StorageResult<()> {
    if range.end > session.total_size {
        return Err(crate::StorageError::InvalidRange(format!(
            "range {range} exceeds object size {}",
            session.total_size
        )));
    }
    if range.len() != len as u64 {
        return Err(crate::StorageError::InvalidRange(format!(
            "range {range} does not match payload length {len}"
        )));
    }
    if range.is_empty() && session.total_size != 0 {
        return Err(crate::StorageError::InvalidRange(
            "empty range for non-empty object".to_string(),
        ));
    }
    Ok(())
}
