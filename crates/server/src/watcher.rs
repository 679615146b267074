//! Cancellation watcher.
//!
//! Cancellation arrives out of band: the cancel endpoint flips the persisted
//! status and the upload notices by polling it. The watcher polls on a fixed
//! interval and trips the session's [`CancellationToken`]; the processor also
//! checks the same status inline before each chunk.

use async_trait::async_trait;
use drivex_core::{FileId, UploadStatus};
use drivex_metadata::MetadataStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read/write access to the persisted status of a session.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Whether the session has been cancelled externally.
    async fn is_cancelled(&self, file_id: FileId) -> bool;

    /// Persist the number of contiguous bytes acknowledged so far.
    async fn record_progress(&self, _file_id: FileId, _bytes: u64) {}
}

/// [`StatusSource`] backed by the metadata store.
pub struct PersistedStatus {
    metadata: Arc<dyn MetadataStore>,
}

impl PersistedStatus {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl StatusSource for PersistedStatus {
    async fn is_cancelled(&self, file_id: FileId) -> bool {
        match self.metadata.get_status(*file_id.as_uuid()).await {
            Ok(status) => status == Some(UploadStatus::Cancelled),
            Err(e) => {
                // A failed poll is not a cancellation; the next one may succeed.
                tracing::warn!(file_id = %file_id, error = %e, "status poll failed");
                false
            }
        }
    }

    async fn record_progress(&self, file_id: FileId, bytes: u64) {
        if let Err(e) = self
            .metadata
            .record_progress(*file_id.as_uuid(), bytes, OffsetDateTime::now_utc())
            .await
        {
            tracing::warn!(file_id = %file_id, error = %e, "failed to persist progress");
        }
    }
}

/// Background task polling one session's status.
pub struct CancellationWatcher {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl CancellationWatcher {
    /// Start polling. `progress` holds the latest acknowledged byte count,
    /// flushed to the status store on each tick when it changed.
    pub fn spawn(
        file_id: FileId,
        status: Arc<dyn StatusSource>,
        interval: Duration,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Self {
        let stop = CancellationToken::new();
        let stop_signal = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the inline check covers that moment.
            ticker.tick().await;
            let mut flushed = 0u64;

            loop {
                tokio::select! {
                    _ = stop_signal.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let bytes = progress.load(Ordering::Acquire);
                        if bytes > flushed {
                            status.record_progress(file_id, bytes).await;
                            flushed = bytes;
                        }
                        if status.is_cancelled(file_id).await {
                            tracing::info!(file_id = %file_id, "cancellation observed by watcher");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Self { stop, handle }
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.handle).await
            && e.is_panic()
        {
            tracing::error!(error = ?e, "cancellation watcher panicked");
        }
    }
}

impl Drop for CancellationWatcher {
    fn drop(&mut self) {
        // Covers sessions torn down without reaching `stop`.
        self.stop.cancel();
    }
}
