//! Upload session protocol handler.
//!
//! Drives one client connection through
//! `AwaitingAdmission -> AwaitingDestinationSession -> Transferring -> {Succeeded | Failed | Cancelled}`.
//!
//! The handler is transport-agnostic: bytes come from a [`ByteSource`] and
//! messages go out through a [`MessageSink`]. Every path out of
//! [`UploadPipeline::run`] goes through one finalization step that persists
//! the outcome, releases the admission ticket and only then sends the single
//! terminal message.

use crate::backup::{BackupDispatcher, BackupJob};
use crate::concurrency::UploadConcurrencyManager;
use crate::error::UploadError;
use crate::metrics;
use crate::processor::{ByteSource, ChunkProcessor, CompletionInfo, Transfer};
use crate::watcher::{CancellationWatcher, PersistedStatus, StatusSource};
use async_trait::async_trait;
use drivex_core::{ProgressCoalescer, ServerMessage, UploadSession, UploadStatus};
use drivex_metadata::MetadataStore;
use drivex_storage::{OpenSessionRequest, ResumableStore};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The client connection can no longer accept messages.
#[derive(Debug, thiserror::Error)]
#[error("client connection closed")]
pub struct SinkClosed;

/// Where server messages go.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkClosed>;

    /// Close the connection after the terminal message.
    async fn close(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingAdmission,
    AwaitingDestinationSession,
    Transferring,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAdmission => "awaiting_admission",
            Self::AwaitingDestinationSession => "awaiting_destination_session",
            Self::Transferring => "transferring",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one session, logging every transition.
struct PhaseTracker {
    file_id: drivex_core::FileId,
    phase: SessionPhase,
}

impl PhaseTracker {
    fn new(file_id: drivex_core::FileId) -> Self {
        Self {
            file_id,
            phase: SessionPhase::AwaitingAdmission,
        }
    }

    fn enter(&mut self, next: SessionPhase) {
        tracing::info!(
            file_id = %self.file_id,
            from = %self.phase,
            to = %next,
            "upload session transition"
        );
        self.phase = next;
    }

    /// Whether this session moved the persisted status to `uploading`.
    fn owns_status(&self) -> bool {
        self.phase != SessionPhase::AwaitingAdmission
    }
}

/// Ordered outgoing messages.
///
/// Progress is queued from synchronous callbacks; a writer task drains the
/// queue into the sink. Nothing is written after the terminal message.
struct Outbox {
    tx: Option<mpsc::UnboundedSender<ServerMessage>>,
    writer: JoinHandle<()>,
}

impl Outbox {
    fn spawn<M: MessageSink>(mut sink: M) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let terminal = message.is_terminal();
                if sink.send(message).await.is_err() {
                    tracing::debug!("client stopped accepting messages");
                    break;
                }
                if terminal {
                    break;
                }
            }
            sink.close().await;
        });
        Self {
            tx: Some(tx),
            writer,
        }
    }

    fn progress(&self, pct: u8) {
        if let Some(tx) = &self.tx {
            // A closed queue means the client is gone; the transfer notices on its own.
            let _ = tx.send(ServerMessage::Progress(pct));
        }
    }

    /// Queue the terminal message and wait until it has been written.
    async fn finish(mut self, terminal: ServerMessage) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(terminal);
        }
        if let Err(e) = (&mut self.writer).await
            && e.is_panic()
        {
            tracing::error!(error = ?e, "message writer panicked");
        }
    }
}

/// Runs upload sessions end to end.
pub struct UploadPipeline {
    concurrency: UploadConcurrencyManager,
    store: Arc<dyn ResumableStore>,
    processor: ChunkProcessor,
    metadata: Arc<dyn MetadataStore>,
    status: Arc<dyn StatusSource>,
    backup: Option<BackupDispatcher>,
    poll_interval: Duration,
}

impl UploadPipeline {
    pub fn new(
        concurrency: UploadConcurrencyManager,
        store: Arc<dyn ResumableStore>,
        processor: ChunkProcessor,
        metadata: Arc<dyn MetadataStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            concurrency,
            store,
            processor,
            status: Arc::new(PersistedStatus::new(metadata.clone())),
            metadata,
            backup: None,
            poll_interval,
        }
    }

    /// Replace the status source polled for cancellation.
    pub fn with_status_source(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = status;
        self
    }

    /// Copy completed uploads to a secondary destination.
    pub fn with_backup(mut self, backup: BackupDispatcher) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn concurrency(&self) -> &UploadConcurrencyManager {
        &self.concurrency
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one session to its terminal state.
    ///
    /// The sink receives non-decreasing progress messages followed by exactly
    /// one `success` or `error` message.
    #[tracing::instrument(
        name = "upload_session",
        skip_all,
        fields(file_id = %session.file_id, owner_id = %session.owner_id)
    )]
    pub async fn run<S, M>(
        &self,
        session: &UploadSession,
        mut source: S,
        sink: M,
    ) -> Result<CompletionInfo, UploadError>
    where
        S: ByteSource,
        M: MessageSink,
    {
        let outbox = Outbox::spawn(sink);
        let mut tracker = PhaseTracker::new(session.file_id);

        let mut ticket = match self
            .concurrency
            .try_admit(&session.owner_id, session.declared_size)
        {
            Ok(ticket) => ticket,
            Err(denied) => {
                metrics::SESSIONS_DENIED
                    .with_label_values(&[denied.reason()])
                    .inc();
                tracing::warn!(reason = denied.reason(), error = %denied, "upload denied admission");
                let err = UploadError::from(denied);
                outbox.finish(ServerMessage::Error(err.to_string())).await;
                return Err(err);
            }
        };
        metrics::SESSIONS_ADMITTED.inc();
        tracing::debug!(reservation = ticket.reservation(), "upload admitted");
        let started = Instant::now();

        let acknowledged = Arc::new(AtomicU64::new(0));
        let result = self
            .transfer(
                session,
                &mut source,
                &outbox,
                &mut tracker,
                &acknowledged,
                ticket.reservation(),
            )
            .await;
        let result = self
            .finalize(
                session,
                &tracker,
                result,
                acknowledged.load(Ordering::Acquire),
            )
            .await;

        // Capacity goes back before the terminal message is queued, so a
        // client that stops reading cannot pin it.
        ticket.release();

        let (outcome, terminal, message) = match &result {
            Ok(info) => (
                "completed",
                SessionPhase::Succeeded,
                ServerMessage::Success(info.retrieval_ref.clone()),
            ),
            Err(err @ UploadError::Cancelled) => (
                "cancelled",
                SessionPhase::Cancelled,
                ServerMessage::Error(err.to_string()),
            ),
            Err(err @ UploadError::ClientDisconnected) => (
                "disconnected",
                SessionPhase::Failed,
                ServerMessage::Error(err.to_string()),
            ),
            Err(err) => (
                "failed",
                SessionPhase::Failed,
                ServerMessage::Error(err.to_string()),
            ),
        };
        tracker.enter(terminal);
        metrics::record_session_outcome(outcome);
        metrics::SESSION_DURATION.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(info) => {
                tracing::info!(
                    bytes = info.bytes_transferred,
                    chunks = info.chunks,
                    strategy = info.strategy.as_str(),
                    retrieval_ref = %info.retrieval_ref,
                    "upload completed"
                );
                if let Some(backup) = &self.backup {
                    backup
                        .schedule(BackupJob {
                            file_id: session.file_id,
                            retrieval_ref: info.retrieval_ref.clone(),
                            file_name: session.file_name.clone(),
                            content_type: session.content_type.clone(),
                            size: session.declared_size,
                        })
                        .await;
                }
            }
            Err(UploadError::Cancelled) => tracing::info!("upload cancelled"),
            Err(err) => tracing::warn!(code = err.code(), error = %err, "upload failed"),
        }

        outbox.finish(message).await;
        result
    }

    async fn transfer(
        &self,
        session: &UploadSession,
        source: &mut dyn ByteSource,
        outbox: &Outbox,
        tracker: &mut PhaseTracker,
        acknowledged: &Arc<AtomicU64>,
        memory_budget: u64,
    ) -> Result<CompletionInfo, UploadError> {
        let file_id = session.file_id;
        let now = OffsetDateTime::now_utc();
        if !self.metadata.mark_uploading(*file_id.as_uuid(), now).await? {
            return match self.metadata.get_status(*file_id.as_uuid()).await? {
                Some(UploadStatus::Cancelled) => Err(UploadError::Cancelled),
                Some(status) => Err(UploadError::Protocol(format!(
                    "upload is {status}, expected pending"
                ))),
                None => Err(UploadError::Protocol("unknown upload".to_string())),
            };
        }

        tracker.enter(SessionPhase::AwaitingDestinationSession);
        let handle = self
            .store
            .open_session(&OpenSessionRequest {
                name: session.file_name.clone(),
                content_type: session.content_type.clone(),
                total_size: session.declared_size,
            })
            .await
            .map_err(UploadError::DestinationSession)?;

        tracker.enter(SessionPhase::Transferring);
        let cancel = CancellationToken::new();
        let watcher = CancellationWatcher::spawn(
            file_id,
            self.status.clone(),
            self.poll_interval,
            cancel.clone(),
            acknowledged.clone(),
        );

        let mut coalescer = ProgressCoalescer::new(session.declared_size);
        let result = self
            .processor
            .process(
                Transfer {
                    file_id,
                    session: &handle,
                    cancel: &cancel,
                    status: self.status.as_ref(),
                    memory_budget,
                },
                source,
                |bytes, _total| {
                    acknowledged.fetch_max(bytes, Ordering::AcqRel);
                    if let Some(pct) = coalescer.update(bytes) {
                        outbox.progress(pct);
                    }
                },
            )
            .await;

        watcher.stop().await;
        result
    }

    /// Persist the outcome. Cancellation is never written here: the cancel
    /// endpoint already did.
    async fn finalize(
        &self,
        session: &UploadSession,
        tracker: &PhaseTracker,
        result: Result<CompletionInfo, UploadError>,
        acknowledged: u64,
    ) -> Result<CompletionInfo, UploadError> {
        let file_id = session.file_id;
        let now = OffsetDateTime::now_utc();

        match result {
            Ok(info) => match self
                .metadata
                .complete_session(
                    *file_id.as_uuid(),
                    &info.retrieval_ref,
                    info.bytes_transferred,
                    now,
                )
                .await
            {
                Ok(true) => Ok(info),
                Ok(false) => {
                    // The last chunk landed after a cancellation; the object is discarded.
                    tracing::info!(file_id = %file_id, "cancelled before completion was recorded");
                    Err(UploadError::Cancelled)
                }
                Err(e) => {
                    tracing::error!(file_id = %file_id, error = %e, "failed to record completion");
                    Err(UploadError::Internal(format!(
                        "could not record completion: {e}"
                    )))
                }
            },
            Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
            Err(err) => {
                if tracker.owns_status() {
                    self.status.record_progress(file_id, acknowledged).await;
                    let detail = err.to_string();
                    match self
                        .metadata
                        .fail_session(*file_id.as_uuid(), err.code(), Some(&detail), now)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(file_id = %file_id, "status already terminal, failure not recorded");
                        }
                        Err(e) => {
                            tracing::error!(file_id = %file_id, error = %e, "failed to record failure");
                        }
                    }
                }
                Err(err)
            }
        }
    }
}
