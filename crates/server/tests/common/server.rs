//! Server test utilities.

use super::mocks::FixedProbe;
use drivex_core::config::{AppConfig, MetadataConfig, StorageConfig};
use drivex_core::{OwnerId, UploadSession};
use drivex_metadata::models::UploadSessionRow;
use drivex_metadata::{MetadataStore, SqliteStore};
use drivex_server::memory::MemoryMonitor;
use drivex_server::{AppState, ProcessorOptions, create_router};
use drivex_storage::{FilesystemBackend, ResumableStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Memory reported by the test probe: large enough that reservations never
/// hit the ceiling unless a test shrinks it.
pub const TEST_MEMORY_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Processor options with fast retries.
#[allow(dead_code)]
pub fn fast_options() -> ProcessorOptions {
    ProcessorOptions {
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        chunk_timeout: Duration::from_secs(10),
        ..ProcessorOptions::default()
    }
}

/// Builder for a test server.
#[allow(dead_code)]
pub struct TestServerBuilder {
    destination: Option<Box<dyn FnOnce(Arc<dyn ResumableStore>) -> Arc<dyn ResumableStore>>>,
    with_backup: bool,
    options: ProcessorOptions,
    memory_total: u64,
}

#[allow(dead_code)]
impl TestServerBuilder {
    /// Wrap the filesystem destination, e.g. in a flaky or slow mock.
    pub fn destination<S, F>(mut self, wrap: F) -> Self
    where
        S: ResumableStore + 'static,
        F: FnOnce(Arc<dyn ResumableStore>) -> Arc<S> + 'static,
    {
        self.destination = Some(Box::new(move |inner| -> Arc<dyn ResumableStore> {
            wrap(inner)
        }));
        self
    }

    pub fn with_backup(mut self) -> Self {
        self.with_backup = true;
        self
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn memory_total(mut self, bytes: u64) -> Self {
        self.memory_total = bytes;
        self
    }

    pub async fn build<F>(self, modifier: F) -> TestServer
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        // Create storage
        let storage_path = temp_dir.path().join("storage");
        let filesystem: Arc<dyn ResumableStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );
        let storage = match self.destination {
            Some(wrap) => wrap(filesystem),
            None => filesystem,
        };

        let backup_path = temp_dir.path().join("backup");
        let backup: Option<Arc<dyn ResumableStore>> = if self.with_backup {
            Some(Arc::new(
                FilesystemBackend::new(&backup_path)
                    .await
                    .expect("Failed to create backup backend"),
            ))
        } else {
            None
        };

        // Create metadata
        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig {
            storage: StorageConfig::Filesystem { path: storage_path },
            backup: self
                .with_backup
                .then(|| StorageConfig::Filesystem { path: backup_path }),
            metadata: MetadataConfig::Sqlite { path: db_path },
            ..AppConfig::for_testing()
        };
        // Short poll interval keeps cancellation tests quick.
        config.upload.cancel_poll_interval_ms = 50;

        // Apply user modifications
        modifier(&mut config);

        let memory = Arc::new(MemoryMonitor::new(
            FixedProbe::new(self.memory_total),
            config.upload.memory_ceiling_percent,
            None,
            config.upload.memory_history_len,
        ));

        let state =
            AppState::with_processor_options(config, storage, backup, metadata, memory, self.options);
        let router = create_router(state.clone());

        TestServer {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::builder().build(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::builder().build(modifier).await
    }

    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            destination: None,
            with_backup: false,
            options: fast_options(),
            memory_total: TEST_MEMORY_BYTES,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Persist a pending session as the initiate endpoint would.
    pub async fn create_session(&self, owner: &str, size: u64) -> UploadSession {
        let session = UploadSession::new(
            OwnerId::new(owner).unwrap(),
            "test.bin",
            "application/octet-stream",
            size,
            None,
        );
        self.metadata()
            .create_session(&UploadSessionRow::from_session(&session).unwrap())
            .await
            .expect("Failed to create session");
        session
    }

    /// Load the persisted session.
    pub async fn load_session(&self, session: &UploadSession) -> UploadSession {
        self.metadata()
            .get_session(*session.file_id.as_uuid())
            .await
            .unwrap()
            .expect("session should exist")
            .into_session()
            .unwrap()
    }
}
