//! Resumable-upload destinations for DirectDriveX.
//!
//! This crate provides:
//! - The `ResumableStore` abstraction: open a session, upload byte ranges,
//!   read completed objects back
//! - Transient/permanent error classification for retry decisions
//! - Backends: local filesystem and a remote HTTP resumable-upload API

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, http::HttpResumableBackend};
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, CompletedObject, OpenSessionRequest, RangeAck, ResumableStore, SessionHandle,
    StoreCapabilities,
};

use drivex_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a destination from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ResumableStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Http {
            endpoint,
            access_token,
            timeout_secs,
        } => {
            let backend = HttpResumableBackend::new(
                endpoint.clone(),
                access_token.clone(),
                Duration::from_secs(*timeout_secs),
            )?;
            Ok(Arc::new(backend))
        }
    }
}
