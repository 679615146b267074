//! Persisted status store for DirectDriveX uploads.
//!
//! This crate provides the pieces of state shared outside the upload
//! process:
//! - Upload sessions and their persisted status
//! - Batches grouping several uploads
//! - Startup recovery of sessions interrupted by a restart

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{INTERRUPTED_ERROR_CODE, MetadataStore, SqliteStore};

use drivex_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
