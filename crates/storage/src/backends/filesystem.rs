//! Local filesystem destination.
//!
//! Each session preallocates `parts/<id>.part` and accepts ranges in any
//! order through positional writes. Once every byte is acknowledged the
//! part file is fsynced and renamed to `objects/<id>`.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, CompletedObject, OpenSessionRequest, RangeAck, ResumableStore, SessionHandle,
    StoreCapabilities, validate_range,
};
use async_trait::async_trait;
use bytes::Bytes;
use drivex_core::{AckedRanges, ByteRange};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const PARTS_DIR: &str = "parts";
const OBJECTS_DIR: &str = "objects";

struct PartState {
    total_size: u64,
    acked: AckedRanges,
}

/// Local filesystem destination supporting out-of-order ranges.
pub struct FilesystemBackend {
    root: PathBuf,
    sessions: Mutex<HashMap<Uuid, PartState>>,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(PARTS_DIR)).await?;
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        Ok(Self {
            root,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn part_path(&self, id: &Uuid) -> PathBuf {
        self.root.join(PARTS_DIR).join(format!("{id}.part"))
    }

    fn object_path(&self, id: &Uuid) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(id.to_string())
    }

    /// References are UUIDs, which also rules out path traversal.
    fn parse_reference(reference: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(reference)
            .map_err(|_| StorageError::NotFound(format!("invalid reference: {reference}")))
    }

    /// Number of sessions opened but not yet completed.
    pub fn open_session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Record `range` and report whether the object is now complete.
    ///
    /// A completed session is removed so exactly one caller finalizes it.
    fn record_range(&self, id: &Uuid, range: ByteRange) -> StorageResult<Option<u64>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| StorageError::Protocol("session table poisoned".to_string()))?;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::SessionNotFound(id.to_string()))?;
        state.acked.insert(range);
        if state.acked.is_complete(state.total_size) {
            let total = state.total_size;
            sessions.remove(id);
            Ok(Some(total))
        } else {
            Ok(None)
        }
    }

    async fn finalize(&self, id: &Uuid, total_size: u64) -> StorageResult<CompletedObject> {
        let part = self.part_path(id);
        let file = fs::OpenOptions::new().write(true).open(&part).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&part, self.object_path(id)).await?;
        tracing::debug!(reference = %id, size = total_size, "object completed");
        Ok(CompletedObject {
            reference: id.to_string(),
            size: total_size,
        })
    }
}

#[async_trait]
impl ResumableStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
        let id = Uuid::new_v4();
        let file = fs::File::create(self.part_path(&id)).await?;
        file.set_len(request.total_size).await?;
        drop(file);

        self.sessions
            .lock()
            .map_err(|_| StorageError::Protocol("session table poisoned".to_string()))?
            .insert(
                id,
                PartState {
                    total_size: request.total_size,
                    acked: AckedRanges::new(),
                },
            );

        Ok(SessionHandle {
            reference: id.to_string(),
            total_size: request.total_size,
        })
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", range = %range))]
    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck> {
        let id = Uuid::parse_str(&session.reference)
            .map_err(|_| StorageError::SessionNotFound(session.reference.clone()))?;
        validate_range(session, range, data.len())?;

        if !data.is_empty() {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(self.part_path(&id))
                .await
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StorageError::SessionNotFound(session.reference.clone())
                    } else {
                        StorageError::Io(e)
                    }
                })?;
            file.seek(std::io::SeekFrom::Start(range.start)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
        }

        match self.record_range(&id, range)? {
            Some(total) => Ok(RangeAck::Complete(self.finalize(&id, total).await?)),
            None => Ok(RangeAck::Partial),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream> {
        let id = Self::parse_reference(reference)?;
        let file = fs::File::open(self.object_path(&id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(reference.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            out_of_order_ranges: true,
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "storage root is not a directory",
            )));
        }
        Ok(())
    }
}
