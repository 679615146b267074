//! Application state shared across handlers.

use crate::backup::{BackupDispatcher, BackupTaskRegistry};
use crate::buffer_pool::BufferPool;
use crate::concurrency::UploadConcurrencyManager;
use crate::memory::MemoryMonitor;
use crate::processor::{ChunkProcessor, ProcessorOptions};
use crate::session::UploadPipeline;
use drivex_core::config::AppConfig;
use drivex_metadata::MetadataStore;
use drivex_storage::ResumableStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Primary destination.
    pub storage: Arc<dyn ResumableStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub memory: Arc<MemoryMonitor>,
    pub buffers: BufferPool,
    pub concurrency: UploadConcurrencyManager,
    pub pipeline: Arc<UploadPipeline>,
    /// Tracks background backup copies; present when a backup destination is configured.
    pub backup_registry: Option<Arc<BackupTaskRegistry>>,
}

impl AppState {
    /// Wire the upload pipeline from its collaborators.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ResumableStore>,
        backup: Option<Arc<dyn ResumableStore>>,
        metadata: Arc<dyn MetadataStore>,
        memory: Arc<MemoryMonitor>,
    ) -> Self {
        Self::with_processor_options(
            config.clone(),
            storage,
            backup,
            metadata,
            memory,
            ProcessorOptions::from_config(&config.upload),
        )
    }

    /// Like [`AppState::new`] with explicit processor tuning.
    pub fn with_processor_options(
        config: AppConfig,
        storage: Arc<dyn ResumableStore>,
        backup: Option<Arc<dyn ResumableStore>>,
        metadata: Arc<dyn MetadataStore>,
        memory: Arc<MemoryMonitor>,
        options: ProcessorOptions,
    ) -> Self {
        let upload = &config.upload;
        let buffers = BufferPool::new(upload.buffer_pool_capacity);
        let concurrency = UploadConcurrencyManager::new(
            upload.global_max_uploads,
            upload.per_user_max_uploads,
            memory.clone(),
        );
        let processor = ChunkProcessor::new(storage.clone(), buffers.clone(), options);

        let backup_registry = backup
            .as_ref()
            .map(|_| Arc::new(BackupTaskRegistry::new(metadata.clone())));

        let mut pipeline = UploadPipeline::new(
            concurrency.clone(),
            storage.clone(),
            processor,
            metadata.clone(),
            upload.cancel_poll_interval(),
        );
        if let (Some(backup_store), Some(registry)) = (backup, &backup_registry) {
            pipeline = pipeline.with_backup(BackupDispatcher::new(
                storage.clone(),
                backup_store,
                metadata.clone(),
                registry.clone(),
            ));
        }

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            memory,
            buffers,
            concurrency,
            pipeline: Arc::new(pipeline),
            backup_registry,
        }
    }
}
