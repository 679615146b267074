//! Secondary copies of completed uploads.
//!
//! After an upload completes, the object is streamed back from the primary
//! destination and pushed sequentially into the backup destination. Copies
//! run in the background and never change the outcome the client saw.

use crate::metrics;
use bytes::{Bytes, BytesMut};
use drivex_core::{BackupStatus, ByteRange, FileId, SizeClass};
use drivex_metadata::MetadataStore;
use drivex_storage::{
    CompletedObject, OpenSessionRequest, RangeAck, ResumableStore, StorageError, StorageResult,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How often the watchdog looks for finished copies.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks spawned backup copies so panicked ones get marked failed.
///
/// A panicking copy never reaches its own status update, which would leave
/// `backup_status` stuck at `pending`.
pub struct BackupTaskRegistry {
    tasks: Mutex<HashMap<FileId, JoinHandle<()>>>,
    metadata: Arc<dyn MetadataStore>,
}

impl BackupTaskRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            metadata,
        }
    }

    /// Register a spawned copy.
    pub async fn register(&self, file_id: FileId, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(file_id, handle);
    }

    /// Copies still tracked.
    pub async fn tracked(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Spawn a watchdog task that periodically reaps finished copies.
    /// Returns the watchdog's JoinHandle.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                self.reap_finished().await;
            }
        })
    }

    /// Collect finished copies, marking panicked ones failed.
    /// Returns how many were reaped.
    pub async fn reap_finished(&self) -> usize {
        // Collect under the lock, await outside it.
        let finished: Vec<(FileId, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let done: Vec<FileId> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(file_id, _)| *file_id)
                .collect();
            done.into_iter()
                .filter_map(|file_id| tasks.remove(&file_id).map(|h| (file_id, h)))
                .collect()
        };

        let reaped = finished.len();
        for (file_id, handle) in finished {
            match handle.await {
                Ok(()) => {
                    tracing::debug!(file_id = %file_id, "backup copy finished");
                }
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(
                        file_id = %file_id,
                        panic = ?join_err,
                        "backup copy panicked, marking failed"
                    );
                    metrics::BACKUP_COPIES.with_label_values(&["panicked"]).inc();
                    if let Err(e) = self
                        .metadata
                        .set_backup_status(
                            *file_id.as_uuid(),
                            BackupStatus::Failed,
                            OffsetDateTime::now_utc(),
                        )
                        .await
                    {
                        tracing::error!(
                            file_id = %file_id,
                            error = %e,
                            "failed to mark panicked backup as failed"
                        );
                    }
                }
                Err(join_err) => {
                    tracing::warn!(file_id = %file_id, error = ?join_err, "backup copy was cancelled");
                }
            }
        }
        reaped
    }
}

/// What to copy.
#[derive(Clone, Debug)]
pub struct BackupJob {
    pub file_id: FileId,
    pub retrieval_ref: String,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// Schedules backup copies of completed uploads.
#[derive(Clone)]
pub struct BackupDispatcher {
    primary: Arc<dyn ResumableStore>,
    backup: Arc<dyn ResumableStore>,
    metadata: Arc<dyn MetadataStore>,
    registry: Arc<BackupTaskRegistry>,
}

impl BackupDispatcher {
    pub fn new(
        primary: Arc<dyn ResumableStore>,
        backup: Arc<dyn ResumableStore>,
        metadata: Arc<dyn MetadataStore>,
        registry: Arc<BackupTaskRegistry>,
    ) -> Self {
        Self {
            primary,
            backup,
            metadata,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<BackupTaskRegistry> {
        &self.registry
    }

    /// Mark the session `pending` and start the copy in the background.
    pub async fn schedule(&self, job: BackupJob) {
        let file_id = job.file_id;
        if let Err(e) = self
            .metadata
            .set_backup_status(
                *file_id.as_uuid(),
                BackupStatus::Pending,
                OffsetDateTime::now_utc(),
            )
            .await
        {
            tracing::error!(file_id = %file_id, error = %e, "failed to mark backup pending, skipping copy");
            return;
        }

        let primary = self.primary.clone();
        let backup = self.backup.clone();
        let metadata = self.metadata.clone();
        let handle = tokio::spawn(async move {
            let request = OpenSessionRequest {
                name: job.file_name.clone(),
                content_type: job.content_type.clone(),
                total_size: job.size,
            };
            let status =
                match copy_object(primary.as_ref(), backup.as_ref(), &job.retrieval_ref, &request)
                    .await
                {
                    Ok(object) => {
                        tracing::info!(
                            file_id = %job.file_id,
                            backup_ref = %object.reference,
                            "backup copy completed"
                        );
                        metrics::BACKUP_COPIES.with_label_values(&["completed"]).inc();
                        BackupStatus::Completed
                    }
                    Err(e) => {
                        tracing::warn!(file_id = %job.file_id, error = %e, "backup copy failed");
                        metrics::BACKUP_COPIES.with_label_values(&["failed"]).inc();
                        BackupStatus::Failed
                    }
                };

            if let Err(e) = metadata
                .set_backup_status(*job.file_id.as_uuid(), status, OffsetDateTime::now_utc())
                .await
            {
                tracing::error!(file_id = %job.file_id, error = %e, "failed to record backup status");
            }
        });

        self.registry.register(file_id, handle).await;
    }
}

/// Stream `reference` out of `primary` and upload it into a new session on `backup`.
pub async fn copy_object(
    primary: &dyn ResumableStore,
    backup: &dyn ResumableStore,
    reference: &str,
    request: &OpenSessionRequest,
) -> StorageResult<CompletedObject> {
    let chunk_len = SizeClass::Small.capacity() as usize;
    let session = backup.open_session(request).await?;
    let mut stream = primary.read_object(reference).await?;

    if request.total_size == 0 {
        return expect_complete(
            backup
                .upload_range(&session, ByteRange::new(0, 0), Bytes::new())
                .await?,
        );
    }

    let mut pending = BytesMut::new();
    let mut offset = 0u64;
    let mut last_ack = RangeAck::Partial;

    while let Some(piece) = stream.next().await {
        pending.extend_from_slice(&piece?);
        while pending.len() >= chunk_len {
            let data = pending.split_to(chunk_len).freeze();
            last_ack = upload_next(backup, &session, &mut offset, data).await?;
        }
    }
    if !pending.is_empty() {
        last_ack = upload_next(backup, &session, &mut offset, pending.freeze()).await?;
    }

    if offset != request.total_size {
        return Err(StorageError::Protocol(format!(
            "primary object has {offset} bytes, expected {}",
            request.total_size
        )));
    }
    expect_complete(last_ack)
}

async fn upload_next(
    backup: &dyn ResumableStore,
    session: &drivex_storage::SessionHandle,
    offset: &mut u64,
    data: Bytes,
) -> StorageResult<RangeAck> {
    let range = ByteRange::new(*offset, *offset + data.len() as u64);
    let ack = backup.upload_range(session, range, data).await?;
    *offset = range.end;
    Ok(ack)
}

fn expect_complete(ack: RangeAck) -> StorageResult<CompletedObject> {
    match ack {
        RangeAck::Complete(object) => Ok(object),
        RangeAck::Partial => Err(StorageError::Protocol(
            "backup destination did not finalize the object".to_string(),
        )),
    }
}
