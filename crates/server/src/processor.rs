//! Chunk processor.
//!
//! Reads client bytes into pooled buffers, cuts them into chunks and pushes
//! each chunk into the destination's resumable session as a byte range.
//!
//! Two strategies:
//! - sequential: one chunk in flight, used for small files and for
//!   destinations that only accept ranges in order;
//! - parallel: up to `parallel_chunks` ranges in flight for destinations that
//!   accept out-of-order ranges, bounded by the transfer's memory budget.
//!   Completion is tracked as a set of acknowledged ranges, never as a byte
//!   counter.
//!
//! Transient chunk failures are retried with exponential backoff. The
//! session's cancellation token is checked before every chunk and between
//! attempts, and in-flight requests are abandoned once it trips.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::UploadError;
use crate::metrics;
use crate::watcher::StatusSource;
use async_trait::async_trait;
use bytes::Bytes;
use drivex_core::chunk::{ChunkPlan, next_chunk, next_chunk_capped};
use drivex_core::SizeClass;
use drivex_core::config::UploadConfig;
use drivex_core::{AckedRanges, ByteRange, FileId};
use drivex_storage::{CompletedObject, RangeAck, ResumableStore, SessionHandle, StorageError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Network timeout for one range upload. Expiry counts as a transient failure.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

/// Where client bytes come from.
#[async_trait]
pub trait ByteSource: Send {
    /// Next piece of file data. `Ok(None)` means the client closed the stream.
    async fn next_bytes(&mut self) -> Result<Option<Bytes>, UploadError>;
}

/// Tuning for the processor.
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Chunks in flight for the parallel strategy; also the target
    /// concurrency used to pick chunk size classes.
    pub parallel_chunks: usize,
    /// Files smaller than this are always sent sequentially.
    pub parallel_threshold_bytes: u64,
    /// Retries after the first attempt of a chunk.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub chunk_timeout: Duration,
}

impl ProcessorOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            parallel_chunks: config.parallel_chunks,
            parallel_threshold_bytes: config.parallel_threshold_bytes,
            max_retries: config.max_chunk_retries,
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
            chunk_timeout: CHUNK_TIMEOUT,
        }
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Parallel,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

/// Result of a fully acknowledged transfer.
#[derive(Clone, Debug)]
pub struct CompletionInfo {
    /// Retrieval reference of the stored object.
    pub retrieval_ref: String,
    pub bytes_transferred: u64,
    pub chunks: usize,
    pub strategy: Strategy,
}

/// Per-transfer inputs.
pub struct Transfer<'a> {
    pub file_id: FileId,
    pub session: &'a SessionHandle,
    pub cancel: &'a CancellationToken,
    pub status: &'a dyn StatusSource,
    /// Bytes of chunk buffers this transfer may hold at once. One chunk is
    /// always allowed in flight, whatever the budget.
    pub memory_budget: u64,
}

/// Backoff before retry number `attempt + 1`: `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Splits client bytes into chunks and relays them to a destination.
pub struct ChunkProcessor {
    store: Arc<dyn ResumableStore>,
    pool: BufferPool,
    options: Arc<ProcessorOptions>,
}

impl ChunkProcessor {
    pub fn new(store: Arc<dyn ResumableStore>, pool: BufferPool, options: ProcessorOptions) -> Self {
        Self {
            store,
            pool,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Pick the strategy for an object of `total` bytes.
    pub fn strategy_for(&self, total: u64) -> Strategy {
        let options = &self.options;
        if self.store.capabilities().out_of_order_ranges
            && options.parallel_chunks > 1
            && total > 0
            && total >= options.parallel_threshold_bytes
        {
            Strategy::Parallel
        } else {
            Strategy::Sequential
        }
    }

    /// Transfer the whole object.
    ///
    /// `on_progress(bytes_so_far, total)` is called after every acknowledged
    /// range with the contiguous high-water mark.
    pub async fn process<F>(
        &self,
        transfer: Transfer<'_>,
        source: &mut dyn ByteSource,
        mut on_progress: F,
    ) -> Result<CompletionInfo, UploadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let total = transfer.session.total_size;
        let mut reader = ChunkReader::new(source, total);
        let strategy = self.strategy_for(total);
        tracing::debug!(
            file_id = %transfer.file_id,
            strategy = strategy.as_str(),
            total,
            "starting transfer"
        );

        match strategy {
            Strategy::Sequential => {
                self.run_sequential(&transfer, &mut reader, &mut on_progress)
                    .await
            }
            Strategy::Parallel => {
                self.run_parallel(&transfer, &mut reader, &mut on_progress)
                    .await
            }
        }
    }

    /// Fast-path cancellation check run before each chunk is issued.
    async fn check_cancelled(&self, transfer: &Transfer<'_>) -> Result<(), UploadError> {
        if transfer.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        if transfer.status.is_cancelled(transfer.file_id).await {
            tracing::info!(file_id = %transfer.file_id, "cancellation observed before chunk");
            transfer.cancel.cancel();
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        transfer: &Transfer<'_>,
        reader: &mut ChunkReader<'_>,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<CompletionInfo, UploadError> {
        let total = transfer.session.total_size;
        let mut tally = Tally::new(total);

        if total == 0 {
            self.check_cancelled(transfer).await?;
            let range = ByteRange::new(0, 0);
            let ack = upload_with_retry(
                self.store.as_ref(),
                transfer.session,
                range,
                Bytes::new(),
                &self.options,
                transfer.cancel,
                transfer.file_id,
            )
            .await?;
            on_progress(tally.record(range, ack), total);
            return tally.finish(Strategy::Sequential);
        }

        let mut offset = 0;
        while let Some(plan) = next_chunk(offset, total, self.options.parallel_chunks) {
            let mut buf = self.pool.acquire(plan.class);
            reader
                .fill(&mut buf, plan.range.len() as usize, transfer.cancel)
                .await?;
            self.check_cancelled(transfer).await?;

            let ack = upload_with_retry(
                self.store.as_ref(),
                transfer.session,
                plan.range,
                buf.freeze_chunk(),
                &self.options,
                transfer.cancel,
                transfer.file_id,
            )
            .await?;
            drop(buf);

            on_progress(tally.record(plan.range, ack), total);
            offset = plan.range.end;
        }

        tally.finish(Strategy::Sequential)
    }

    async fn run_parallel(
        &self,
        transfer: &Transfer<'_>,
        reader: &mut ChunkReader<'_>,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<CompletionInfo, UploadError> {
        let total = transfer.session.total_size;
        let width = self.options.parallel_chunks.max(1);
        let budget = transfer.memory_budget;
        let max_class = SizeClass::largest_within(budget / width as u64);
        let mut tally = Tally::new(total);
        // Dropping the set on an early return aborts whatever is still in flight.
        let mut in_flight: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut held: u64 = 0;
        let mut offset = 0;

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                let (plan, ack) = unpack(joined)?;
                held -= plan.class.capacity();
                on_progress(tally.record(plan.range, ack), total);
            }

            if in_flight.len() < width
                && let Some(plan) = next_chunk_capped(offset, total, width, max_class)
                && (in_flight.is_empty() || held + plan.class.capacity() <= budget)
            {
                let mut buf = self.pool.acquire(plan.class);
                reader
                    .fill(&mut buf, plan.range.len() as usize, transfer.cancel)
                    .await?;
                self.check_cancelled(transfer).await?;

                let data = buf.freeze_chunk();
                let store = self.store.clone();
                let session = transfer.session.clone();
                let options = self.options.clone();
                let cancel = transfer.cancel.clone();
                let file_id = transfer.file_id;
                held += plan.class.capacity();
                in_flight.spawn(async move {
                    let result = upload_with_retry(
                        store.as_ref(),
                        &session,
                        plan.range,
                        data,
                        &options,
                        &cancel,
                        file_id,
                    )
                    .await;
                    drop(buf);
                    (plan, result)
                });
                offset = plan.range.end;
                continue;
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = transfer.cancel.cancelled() => return Err(UploadError::Cancelled),
                Some(joined) = in_flight.join_next() => joined,
            };
            let (plan, ack) = unpack(joined)?;
            held -= plan.class.capacity();
            on_progress(tally.record(plan.range, ack), total);
        }

        tally.finish(Strategy::Parallel)
    }
}

type ChunkOutcome = (ChunkPlan, Result<RangeAck, UploadError>);

fn unpack(joined: Result<ChunkOutcome, JoinError>) -> Result<(ChunkPlan, RangeAck), UploadError> {
    match joined {
        Ok((plan, Ok(ack))) => Ok((plan, ack)),
        Ok((_, Err(e))) => Err(e),
        Err(e) => Err(UploadError::Internal(format!("chunk task failed: {e}"))),
    }
}

/// Acknowledged ranges of one transfer.
struct Tally {
    total: u64,
    acked: AckedRanges,
    completed: Option<CompletedObject>,
    chunks: usize,
}

impl Tally {
    fn new(total: u64) -> Self {
        Self {
            total,
            acked: AckedRanges::new(),
            completed: None,
            chunks: 0,
        }
    }

    /// Record an acknowledged range; returns the contiguous high-water mark.
    fn record(&mut self, range: ByteRange, ack: RangeAck) -> u64 {
        self.acked.insert(range);
        self.chunks += 1;
        if let RangeAck::Complete(object) = ack {
            self.completed = Some(object);
        }
        self.acked.high_water_mark()
    }

    fn finish(self, strategy: Strategy) -> Result<CompletionInfo, UploadError> {
        if let Some(gap) = self.acked.gaps(self.total).first() {
            return Err(UploadError::ChunkUploadFailed {
                range: *gap,
                attempts: 0,
                reason: "range was never acknowledged".to_string(),
            });
        }
        let Some(object) = self.completed else {
            return Err(UploadError::ChunkUploadFailed {
                range: ByteRange::new(0, self.total),
                attempts: 1,
                reason: "destination acknowledged every range but did not finalize the object"
                    .to_string(),
            });
        };
        Ok(CompletionInfo {
            retrieval_ref: object.reference,
            bytes_transferred: self.acked.high_water_mark(),
            chunks: self.chunks,
            strategy,
        })
    }
}

/// Upload one range, retrying transient failures with backoff.
async fn upload_with_retry(
    store: &dyn ResumableStore,
    session: &SessionHandle,
    range: ByteRange,
    data: Bytes,
    options: &ProcessorOptions,
    cancel: &CancellationToken,
    file_id: FileId,
) -> Result<RangeAck, UploadError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            outcome = tokio::time::timeout(
                options.chunk_timeout,
                store.upload_range(session, range, data.clone()),
            ) => outcome,
        };

        let error = match outcome {
            Ok(Ok(ack)) => {
                metrics::CHUNK_UPLOAD_DURATION.observe(started.elapsed().as_secs_f64());
                metrics::CHUNKS_UPLOADED.inc();
                metrics::BYTES_UPLOADED.inc_by(range.len());
                return Ok(ack);
            }
            Ok(Err(e)) => e,
            Err(_) => StorageError::Timeout(format!(
                "range {range} timed out after {:?}",
                options.chunk_timeout
            )),
        };

        if !error.is_transient() || attempt >= options.max_retries {
            return Err(UploadError::ChunkUploadFailed {
                range,
                attempts: attempt + 1,
                reason: error.to_string(),
            });
        }

        let delay = backoff_delay(attempt, options.retry_base_delay, options.retry_max_delay);
        attempt += 1;
        metrics::CHUNK_RETRIES.inc();
        tracing::warn!(
            file_id = %file_id,
            range = %range,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying chunk upload"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Reassembles client frames into chunk-sized pieces.
struct ChunkReader<'a> {
    source: &'a mut dyn ByteSource,
    leftover: Bytes,
    received: u64,
    declared: u64,
}

impl<'a> ChunkReader<'a> {
    fn new(source: &'a mut dyn ByteSource, declared: u64) -> Self {
        Self {
            source,
            leftover: Bytes::new(),
            received: 0,
            declared,
        }
    }

    /// Fill `buf` with exactly `len` bytes.
    async fn fill(
        &mut self,
        buf: &mut PooledBuffer,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        while buf.len() < len {
            if self.leftover.is_empty() {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    next = self.source.next_bytes() => next?,
                };
                let Some(bytes) = next else {
                    return Err(UploadError::ClientDisconnected);
                };
                self.received += bytes.len() as u64;
                if self.received > self.declared {
                    return Err(UploadError::Protocol(format!(
                        "received more than the declared {} bytes",
                        self.declared
                    )));
                }
                self.leftover = bytes;
                continue;
            }
            let take = (len - buf.len()).min(self.leftover.len());
            let piece = self.leftover.split_to(take);
            buf.extend_from_slice(&piece);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivex_core::MIB;
    use drivex_storage::backends::filesystem::FilesystemBackend;
    use drivex_storage::{OpenSessionRequest, StorageResult, StoreCapabilities};
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

    struct Frames(VecDeque<Bytes>);

    impl Frames {
        fn split(data: &[u8], frame: usize) -> Self {
            Self(data.chunks(frame).map(Bytes::copy_from_slice).collect())
        }
    }

    #[async_trait]
    impl ByteSource for Frames {
        async fn next_bytes(&mut self) -> Result<Option<Bytes>, UploadError> {
            Ok(self.0.pop_front())
        }
    }

    struct NotCancelled;

    #[async_trait]
    impl StatusSource for NotCancelled {
        async fn is_cancelled(&self, _file_id: FileId) -> bool {
            false
        }
    }

    /// Fails every upload with the given error.
    struct FailingStore {
        error: fn() -> StorageError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ResumableStore for FailingStore {
        async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
            Ok(SessionHandle {
                reference: "s".to_string(),
                total_size: request.total_size,
            })
        }

        async fn upload_range(
            &self,
            _session: &SessionHandle,
            _range: ByteRange,
            _data: Bytes,
        ) -> StorageResult<RangeAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }

        async fn read_object(&self, reference: &str) -> StorageResult<drivex_storage::ByteStream> {
            Err(StorageError::NotFound(reference.to_string()))
        }

        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities {
                out_of_order_ranges: false,
            }
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    fn fast_options() -> ProcessorOptions {
        ProcessorOptions {
            parallel_chunks: 4,
            parallel_threshold_bytes: 16 * MIB,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            chunk_timeout: Duration::from_secs(5),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn read_back(store: &dyn ResumableStore, reference: &str) -> Vec<u8> {
        let mut stream = store.read_object(reference).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn run(
        store: Arc<dyn ResumableStore>,
        options: ProcessorOptions,
        data: &[u8],
        frame: usize,
    ) -> (Result<CompletionInfo, UploadError>, Vec<u64>) {
        run_with_budget(store, options, data, frame, u64::MAX).await
    }

    async fn run_with_budget(
        store: Arc<dyn ResumableStore>,
        options: ProcessorOptions,
        data: &[u8],
        frame: usize,
        memory_budget: u64,
    ) -> (Result<CompletionInfo, UploadError>, Vec<u64>) {
        let processor = ChunkProcessor::new(store.clone(), BufferPool::new(8), options);
        let session = store
            .open_session(&OpenSessionRequest {
                name: "f".to_string(),
                content_type: "application/octet-stream".to_string(),
                total_size: data.len() as u64,
            })
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut source = Frames::split(data, frame.max(1));
        let mut reports = Vec::new();
        let result = processor
            .process(
                Transfer {
                    file_id: FileId::new(),
                    session: &session,
                    cancel: &cancel,
                    status: &NotCancelled,
                    memory_budget,
                },
                &mut source,
                |bytes, _total| reports.push(bytes),
            )
            .await;
        (result, reports)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(8);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(64, base, max), max);
    }

    #[tokio::test]
    async fn test_strategy_selection() {
        let temp = tempfile::tempdir().unwrap();
        let fs: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let processor = ChunkProcessor::new(fs, BufferPool::new(1), fast_options());
        assert_eq!(processor.strategy_for(MIB), Strategy::Sequential);
        assert_eq!(processor.strategy_for(16 * MIB), Strategy::Parallel);
        assert_eq!(processor.strategy_for(0), Strategy::Sequential);

        let in_order: Arc<dyn ResumableStore> = Arc::new(FailingStore {
            error: || StorageError::Transport("x".into()),
            calls: AtomicU32::new(0),
        });
        let processor = ChunkProcessor::new(in_order, BufferPool::new(1), fast_options());
        assert_eq!(processor.strategy_for(64 * MIB), Strategy::Sequential);
    }

    #[tokio::test]
    async fn test_sequential_transfer_with_uneven_frames() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let data = pattern(9 * MIB as usize + 123);

        let (result, reports) = run(store.clone(), fast_options(), &data, 300_001).await;
        let info = result.unwrap();
        assert_eq!(info.strategy, Strategy::Sequential);
        assert_eq!(info.bytes_transferred, data.len() as u64);
        assert_eq!(*reports.last().unwrap(), data.len() as u64);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(read_back(store.as_ref(), &info.retrieval_ref).await, data);
    }

    #[tokio::test]
    async fn test_parallel_transfer_reassembles_object() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let data = pattern(40 * MIB as usize + 7);

        let (result, reports) = run(store.clone(), fast_options(), &data, MIB as usize).await;
        let info = result.unwrap();
        assert_eq!(info.strategy, Strategy::Parallel);
        assert!(info.chunks > 1);
        assert_eq!(*reports.last().unwrap(), data.len() as u64);
        assert_eq!(read_back(store.as_ref(), &info.retrieval_ref).await, data);
    }

    /// Filesystem store that records how many ranges are uploading at once
    /// and the largest range it was sent.
    struct Gauged {
        inner: FilesystemBackend,
        current: AtomicUsize,
        peak: AtomicUsize,
        largest: AtomicU64,
    }

    #[async_trait]
    impl ResumableStore for Gauged {
        async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
            self.inner.open_session(request).await
        }

        async fn upload_range(
            &self,
            session: &SessionHandle,
            range: ByteRange,
            data: Bytes,
        ) -> StorageResult<RangeAck> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.largest.fetch_max(range.len(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.upload_range(session, range, data).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn read_object(&self, reference: &str) -> StorageResult<drivex_storage::ByteStream> {
            self.inner.read_object(reference).await
        }

        fn capabilities(&self) -> StoreCapabilities {
            self.inner.capabilities()
        }

        fn backend_name(&self) -> &'static str {
            "gauged"
        }
    }

    #[tokio::test]
    async fn test_parallel_chunks_stay_within_memory_budget() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(Gauged {
            inner: FilesystemBackend::new(temp.path()).await.unwrap(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            largest: AtomicU64::new(0),
        });
        let data = pattern(40 * MIB as usize);

        // Room for two small buffers: width 4 would otherwise pick 16 MiB chunks.
        let (result, _) =
            run_with_budget(store.clone(), fast_options(), &data, MIB as usize, 16 * MIB).await;
        let info = result.unwrap();
        assert_eq!(info.strategy, Strategy::Parallel);
        assert_eq!(info.chunks, 5);
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(store.largest.load(Ordering::SeqCst), 8 * MIB);
        assert_eq!(read_back(store.as_ref(), &info.retrieval_ref).await, data);
    }

    #[tokio::test]
    async fn test_tiny_budget_still_makes_progress() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(Gauged {
            inner: FilesystemBackend::new(temp.path()).await.unwrap(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            largest: AtomicU64::new(0),
        });
        let data = pattern(20 * MIB as usize);

        let (result, _) = run_with_budget(store.clone(), fast_options(), &data, MIB as usize, 1).await;
        let info = result.unwrap();
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert_eq!(info.chunks, 3);
        assert_eq!(read_back(store.as_ref(), &info.retrieval_ref).await, data);
    }

    #[tokio::test]
    async fn test_empty_object_uses_single_empty_range() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let (result, reports) = run(store, fast_options(), &[], 1).await;
        let info = result.unwrap();
        assert_eq!(info.bytes_transferred, 0);
        assert_eq!(info.chunks, 1);
        assert_eq!(reports, vec![0]);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retry_budget() {
        let store = Arc::new(FailingStore {
            error: || StorageError::Http {
                status: 503,
                message: "unavailable".into(),
            },
            calls: AtomicU32::new(0),
        });
        let (result, _) = run(store.clone(), fast_options(), &pattern(1000), 1000).await;
        match result {
            Err(UploadError::ChunkUploadFailed { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected ChunkUploadFailed, got {other:?}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = Arc::new(FailingStore {
            error: || StorageError::Http {
                status: 400,
                message: "bad range".into(),
            },
            calls: AtomicU32::new(0),
        });
        let (result, _) = run(store.clone(), fast_options(), &pattern(1000), 1000).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkUploadFailed { attempts: 1, .. })
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_stream_is_a_disconnect() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let processor = ChunkProcessor::new(store.clone(), BufferPool::new(2), fast_options());
        let session = store
            .open_session(&OpenSessionRequest {
                name: "f".to_string(),
                content_type: "text/plain".to_string(),
                total_size: 100,
            })
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut source = Frames::split(&pattern(60), 60);

        let result = processor
            .process(
                Transfer {
                    file_id: FileId::new(),
                    session: &session,
                    cancel: &cancel,
                    status: &NotCancelled,
                    memory_budget: u64::MAX,
                },
                &mut source,
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(UploadError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_excess_bytes_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResumableStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let processor = ChunkProcessor::new(store.clone(), BufferPool::new(2), fast_options());
        let session = store
            .open_session(&OpenSessionRequest {
                name: "f".to_string(),
                content_type: "text/plain".to_string(),
                total_size: 10,
            })
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut source = Frames::split(&pattern(12), 12);

        let result = processor
            .process(
                Transfer {
                    file_id: FileId::new(),
                    session: &session,
                    cancel: &cancel,
                    status: &NotCancelled,
                    memory_budget: u64::MAX,
                },
                &mut source,
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(UploadError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_tripped_token_stops_before_first_chunk() {
        let store = Arc::new(FailingStore {
            error: || StorageError::Transport("unused".into()),
            calls: AtomicU32::new(0),
        });
        let processor = ChunkProcessor::new(store.clone(), BufferPool::new(2), fast_options());
        let session = SessionHandle {
            reference: "s".to_string(),
            total_size: 10,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = Frames::split(&pattern(10), 10);

        let result = processor
            .process(
                Transfer {
                    file_id: FileId::new(),
                    session: &session,
                    cancel: &cancel,
                    status: &NotCancelled,
                    memory_budget: u64::MAX,
                },
                &mut source,
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }
}
