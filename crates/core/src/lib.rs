//! Core domain types and shared logic for the DirectDriveX upload pipeline.
//!
//! This crate defines the canonical data model used across all other crates:
//! - File, batch and owner identifiers
//! - Upload session lifecycle and persisted status transitions
//! - Chunk size classes and acknowledged byte ranges
//! - Progress coalescing for client notifications
//! - Memory reservation sizing
//! - Client/server wire messages
//! - Configuration

pub mod chunk;
pub mod config;
pub mod error;
pub mod progress;
pub mod ranges;
pub mod reservation;
pub mod upload;
pub mod wire;

pub use chunk::SizeClass;
pub use error::{Error, Result};
pub use progress::ProgressCoalescer;
pub use ranges::{AckedRanges, ByteRange};
pub use reservation::reservation_for_size;
pub use upload::{BackupStatus, BatchId, FileId, OwnerId, UploadSession, UploadStatus};
pub use wire::ServerMessage;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;
