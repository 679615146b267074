//! Mock destinations, byte sources and message sinks.

use async_trait::async_trait;
use bytes::Bytes;
use drivex_core::{ByteRange, ServerMessage};
use drivex_server::error::UploadError;
use drivex_server::{ByteSource, MemoryProbe, MessageSink, SinkClosed};
use drivex_storage::{
    ByteStream, OpenSessionRequest, RangeAck, ResumableStore, SessionHandle, StorageError,
    StorageResult, StoreCapabilities,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Memory probe with fixed totals.
#[allow(dead_code)]
pub struct FixedProbe {
    pub total: u64,
    pub process: AtomicU64,
}

#[allow(dead_code)]
impl FixedProbe {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            process: AtomicU64::new(0),
        })
    }
}

impl MemoryProbe for FixedProbe {
    fn total_memory(&self) -> u64 {
        self.total
    }

    fn process_memory(&self) -> u64 {
        self.process.load(Ordering::SeqCst)
    }
}

/// Fails the first `failures` range uploads with a 503, then delegates.
#[allow(dead_code)]
pub struct FlakyDestination {
    inner: Arc<dyn ResumableStore>,
    failures_left: AtomicU32,
    pub calls: AtomicU32,
}

#[allow(dead_code)]
impl FlakyDestination {
    pub fn new(inner: Arc<dyn ResumableStore>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ResumableStore for FlakyDestination {
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
        self.inner.open_session(request).await
    }

    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Http {
                status: 503,
                message: "injected failure".to_string(),
            });
        }
        self.inner.upload_range(session, range, data).await
    }

    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream> {
        self.inner.read_object(reference).await
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Waits a fixed delay before every range upload.
#[allow(dead_code)]
pub struct SlowDestination {
    inner: Arc<dyn ResumableStore>,
    delay: Duration,
}

#[allow(dead_code)]
impl SlowDestination {
    pub fn new(inner: Arc<dyn ResumableStore>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl ResumableStore for SlowDestination {
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
        self.inner.open_session(request).await
    }

    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload_range(session, range, data).await
    }

    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream> {
        self.inner.read_object(reference).await
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

/// Records every range in completion order.
///
/// With `reorder`, ranges earlier in the file take longer, so they complete
/// after later ones when uploaded concurrently.
#[allow(dead_code)]
pub struct RecordingDestination {
    inner: Arc<dyn ResumableStore>,
    reorder: bool,
    pub completed: Mutex<Vec<ByteRange>>,
}

#[allow(dead_code)]
impl RecordingDestination {
    pub fn new(inner: Arc<dyn ResumableStore>, reorder: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reorder,
            completed: Mutex::new(Vec::new()),
        })
    }

    pub fn completed(&self) -> Vec<ByteRange> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResumableStore for RecordingDestination {
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
        self.inner.open_session(request).await
    }

    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck> {
        if self.reorder && session.total_size > 0 {
            let remaining = session.total_size - range.start;
            let delay_ms = remaining * 40 / session.total_size;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let ack = self.inner.upload_range(session, range, data).await?;
        self.completed.lock().unwrap().push(range);
        Ok(ack)
    }

    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream> {
        self.inner.read_object(reference).await
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

/// Serves a fixed list of frames, then reports the client gone.
#[allow(dead_code)]
pub struct FrameSource(pub VecDeque<Bytes>);

#[allow(dead_code)]
impl FrameSource {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self(frames.into())
    }
}

#[async_trait]
impl ByteSource for FrameSource {
    async fn next_bytes(&mut self) -> Result<Option<Bytes>, UploadError> {
        Ok(self.0.pop_front())
    }
}

/// Bytes pushed by the test through a channel.
#[allow(dead_code)]
pub struct ChannelSource(pub mpsc::Receiver<Bytes>);

#[async_trait]
impl ByteSource for ChannelSource {
    async fn next_bytes(&mut self) -> Result<Option<Bytes>, UploadError> {
        Ok(self.0.recv().await)
    }
}

/// Collects every message sent to the client.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct CollectingSink {
    messages: Arc<Mutex<Vec<ServerMessage>>>,
}

#[allow(dead_code)]
impl CollectingSink {
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for CollectingSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkClosed> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// Sink that holds the terminal message until the test opens the gate.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct GatedSink {
    pub inner: CollectingSink,
    /// Signalled when the terminal message reaches the sink.
    pub arrived: Arc<tokio::sync::Notify>,
    pub gate: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl MessageSink for GatedSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkClosed> {
        if message.is_terminal() {
            self.arrived.notify_one();
            self.gate.notified().await;
        }
        self.inner.send(message).await
    }
}
