//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Destination backend configuration, used for both the primary store and
/// the optional backup copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem destination.
    Filesystem {
        /// Root directory for objects and partial uploads.
        path: PathBuf,
    },
    /// Remote resumable-upload HTTP API.
    Http {
        /// Base URL, e.g. `https://storage.example.com/upload/v1`.
        endpoint: String,
        /// Bearer token sent with every request.
        /// WARNING: Prefer DRIVEX_STORAGE__ACCESS_TOKEN over storing it in config.
        access_token: Option<String>,
        /// Per-request timeout in seconds.
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_http_timeout_secs() -> u64 {
    120
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { .. } => Ok(()),
            StorageConfig::Http {
                endpoint,
                timeout_secs,
                ..
            } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(format!(
                        "http storage endpoint must start with http:// or https://, got {endpoint:?}"
                    ));
                }
                if *timeout_secs == 0 {
                    return Err("http storage timeout_secs must be greater than 0".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Upload pipeline limits and timings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum simultaneously admitted uploads across all users.
    #[serde(default = "default_global_max_uploads")]
    pub global_max_uploads: usize,
    /// Maximum simultaneously admitted uploads for one owner.
    /// Sized to the common batch width; there is no waiting queue.
    #[serde(default = "default_per_user_max_uploads")]
    pub per_user_max_uploads: usize,
    /// Share of total memory that outstanding reservations may claim.
    #[serde(default = "default_memory_ceiling_percent")]
    pub memory_ceiling_percent: u8,
    /// Override for detected total system memory, in bytes.
    #[serde(default)]
    pub memory_total_bytes: Option<u64>,
    /// Number of memory samples kept for the status endpoint.
    #[serde(default = "default_memory_history_len")]
    pub memory_history_len: usize,
    /// Seconds between memory samples.
    #[serde(default = "default_memory_sample_interval_secs")]
    pub memory_sample_interval_secs: u64,
    /// Maximum idle buffers kept by the chunk buffer pool.
    #[serde(default = "default_buffer_pool_capacity")]
    pub buffer_pool_capacity: usize,
    /// Chunks of one file in flight at once for the parallel strategy.
    #[serde(default = "default_parallel_chunks")]
    pub parallel_chunks: usize,
    /// Files smaller than this use the sequential strategy.
    #[serde(default = "default_parallel_threshold_bytes")]
    pub parallel_threshold_bytes: u64,
    /// Retries after the first attempt of a chunk.
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Interval at which the cancellation watcher polls persisted status.
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,
}

fn default_global_max_uploads() -> usize {
    20
}

fn default_per_user_max_uploads() -> usize {
    5
}

fn default_memory_ceiling_percent() -> u8 {
    80
}

fn default_memory_history_len() -> usize {
    60
}

fn default_memory_sample_interval_secs() -> u64 {
    5
}

fn default_buffer_pool_capacity() -> usize {
    50
}

fn default_parallel_chunks() -> usize {
    8
}

fn default_parallel_threshold_bytes() -> u64 {
    64 * crate::MIB
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_cancel_poll_interval_ms() -> u64 {
    500
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            global_max_uploads: default_global_max_uploads(),
            per_user_max_uploads: default_per_user_max_uploads(),
            memory_ceiling_percent: default_memory_ceiling_percent(),
            memory_total_bytes: None,
            memory_history_len: default_memory_history_len(),
            memory_sample_interval_secs: default_memory_sample_interval_secs(),
            buffer_pool_capacity: default_buffer_pool_capacity(),
            parallel_chunks: default_parallel_chunks(),
            parallel_threshold_bytes: default_parallel_threshold_bytes(),
            max_chunk_retries: default_max_chunk_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
        }
    }
}

impl UploadConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_secs(self.memory_sample_interval_secs)
    }

    /// Validate upload configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.global_max_uploads == 0 {
            return Err("upload.global_max_uploads must be greater than 0".to_string());
        }
        if self.per_user_max_uploads == 0 {
            return Err("upload.per_user_max_uploads must be greater than 0".to_string());
        }
        if self.per_user_max_uploads > self.global_max_uploads {
            return Err(format!(
                "upload.per_user_max_uploads ({}) cannot exceed upload.global_max_uploads ({})",
                self.per_user_max_uploads, self.global_max_uploads
            ));
        }
        if !(1..=100).contains(&self.memory_ceiling_percent) {
            return Err(format!(
                "upload.memory_ceiling_percent must be within 1..=100, got {}",
                self.memory_ceiling_percent
            ));
        }
        if self.memory_total_bytes == Some(0) {
            return Err("upload.memory_total_bytes must be greater than 0 when set".to_string());
        }
        if self.memory_history_len == 0 {
            return Err("upload.memory_history_len must be greater than 0".to_string());
        }
        if self.memory_sample_interval_secs == 0 {
            return Err("upload.memory_sample_interval_secs must be greater than 0".to_string());
        }
        if self.parallel_chunks == 0 {
            return Err("upload.parallel_chunks must be greater than 0".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(format!(
                "upload.retry_base_delay_ms ({}) cannot exceed upload.retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }
        if self.cancel_poll_interval_ms == 0 {
            return Err("upload.cancel_poll_interval_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Primary destination.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Secondary destination receiving a copy of every completed upload.
    #[serde(default)]
    pub backup: Option<StorageConfig>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        if let Some(backup) = &self.backup {
            backup.validate().map_err(|e| format!("backup: {e}"))?;
        }
        self.upload.validate()
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing() -> Self {
        Self::default()
    }
}
