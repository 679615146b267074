//! Upload server for DirectDriveX.
//!
//! This crate provides the upload pipeline and its HTTP surface:
//! - Admission control (global/per-user limits plus memory reservations)
//! - Chunk buffer pooling
//! - Sequential and parallel chunk relay with retry and backoff
//! - The per-file WebSocket protocol and its cancellation watcher
//! - Cancellation, batch and status endpoints
//! - Backup copies of completed uploads

pub mod backup;
pub mod buffer_pool;
pub mod concurrency;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod metrics;
pub mod processor;
pub mod routes;
pub mod session;
pub mod state;
pub mod watcher;

pub use concurrency::{AdmissionDenied, AdmissionTicket, UploadConcurrencyManager};
pub use error::{ApiError, UploadError};
pub use memory::{MemoryMonitor, MemoryProbe};
pub use processor::{ByteSource, ChunkProcessor, CompletionInfo, ProcessorOptions};
pub use routes::create_router;
pub use session::{MessageSink, SinkClosed, UploadPipeline};
pub use state::AppState;
