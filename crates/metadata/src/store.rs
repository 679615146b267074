//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{BatchRepo, SessionRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Error code recorded for sessions orphaned by a restart.
pub const INTERRUPTED_ERROR_CODE: &str = "interrupted";

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: SessionRepo + BatchRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) a SQLite store at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single writer connection avoids "database is locked" under axum concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use drivex_core::{BackupStatus, UploadStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl SessionRepo for SqliteStore {
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    file_id, batch_id, owner_id, file_name, content_type,
                    declared_size, bytes_transferred, status, retrieval_ref,
                    error_code, error_detail, backup_status,
                    created_at, updated_at, cancelled_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.file_id)
            .bind(session.batch_id)
            .bind(&session.owner_id)
            .bind(&session.file_name)
            .bind(&session.content_type)
            .bind(session.declared_size)
            .bind(session.bytes_transferred)
            .bind(&session.status)
            .bind(&session.retrieval_ref)
            .bind(&session.error_code)
            .bind(&session.error_detail)
            .bind(&session.backup_status)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.cancelled_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                    MetadataError::AlreadyExists(format!("file_id {}", session.file_id)),
                ),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_session(&self, file_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE file_id = ?",
            )
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_status(&self, file_id: Uuid) -> MetadataResult<Option<UploadStatus>> {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM upload_sessions WHERE file_id = ?")
                    .bind(file_id)
                    .fetch_optional(&self.pool)
                    .await?;
            status
                .map(|s| UploadStatus::parse(&s).map_err(MetadataError::from))
                .transpose()
        }

        async fn mark_uploading(&self, file_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET status = 'uploading', updated_at = ? \
                 WHERE file_id = ? AND status = 'pending'",
            )
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn record_progress(
            &self,
            file_id: Uuid,
            bytes: u64,
            at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE upload_sessions \
                 SET bytes_transferred = MAX(bytes_transferred, ?), updated_at = ? \
                 WHERE file_id = ? AND status = 'uploading'",
            )
            .bind(to_i64(bytes)?)
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn complete_session(
            &self,
            file_id: Uuid,
            retrieval_ref: &str,
            bytes: u64,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions \
                 SET status = 'completed', retrieval_ref = ?, \
                     bytes_transferred = MAX(bytes_transferred, ?), updated_at = ? \
                 WHERE file_id = ? AND status = 'uploading'",
            )
            .bind(retrieval_ref)
            .bind(to_i64(bytes)?)
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn fail_session(
            &self,
            file_id: Uuid,
            error_code: &str,
            error_detail: Option<&str>,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions \
                 SET status = 'failed', error_code = ?, error_detail = ?, updated_at = ? \
                 WHERE file_id = ? AND status IN ('pending', 'uploading')",
            )
            .bind(error_code)
            .bind(error_detail)
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn cancel_session(&self, file_id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE upload_sessions \
                 SET status = 'cancelled', cancelled_at = ?, updated_at = ? \
                 WHERE file_id = ? AND status IN ('pending', 'uploading')",
            )
            .bind(at)
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            match self.get_status(file_id).await? {
                None => Err(MetadataError::NotFound(format!("upload {file_id}"))),
                Some(current) => Err(MetadataError::InvalidStateTransition {
                    from: current.as_str().to_string(),
                    to: UploadStatus::Cancelled.as_str().to_string(),
                }),
            }
        }

        async fn recover_interrupted(&self, at: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE upload_sessions \
                 SET status = 'failed', error_code = ?, \
                     error_detail = 'server restarted during transfer', updated_at = ? \
                 WHERE status = 'uploading'",
            )
            .bind(INTERRUPTED_ERROR_CODE)
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn set_backup_status(
            &self,
            file_id: Uuid,
            status: BackupStatus,
            at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET backup_status = ?, updated_at = ? WHERE file_id = ?",
            )
            .bind(status.as_str())
            .bind(at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload {file_id}")));
            }
            Ok(())
        }

        async fn list_batch_sessions(
            &self,
            batch_id: Uuid,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE batch_id = ? ORDER BY created_at",
            )
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_by_status(&self) -> MetadataResult<Vec<(String, u64)>> {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT status, COUNT(*) FROM upload_sessions GROUP BY status ORDER BY status",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(|(status, count)| Ok((status, to_u64(count)?)))
                .collect()
        }
    }

    #[async_trait]
    impl BatchRepo for SqliteStore {
        async fn create_batch(&self, batch: &UploadBatchRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO upload_batches (batch_id, owner_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(batch.batch_id)
            .bind(&batch.owner_id)
            .bind(batch.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_batch(&self, batch_id: Uuid) -> MetadataResult<Option<UploadBatchRow>> {
            let row = sqlx::query_as::<_, UploadBatchRow>(
                "SELECT * FROM upload_batches WHERE batch_id = ?",
            )
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn cancel_batch(&self, batch_id: Uuid, at: OffsetDateTime) -> MetadataResult<u64> {
            if self.get_batch(batch_id).await?.is_none() {
                return Err(MetadataError::NotFound(format!("batch {batch_id}")));
            }
            let result = sqlx::query(
                "UPDATE upload_sessions \
                 SET status = 'cancelled', cancelled_at = ?, updated_at = ? \
                 WHERE batch_id = ? AND status IN ('pending', 'uploading')",
            )
            .bind(at)
            .bind(at)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_batches (
    batch_id BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS upload_sessions (
    file_id BLOB PRIMARY KEY,
    batch_id BLOB REFERENCES upload_batches(batch_id),
    owner_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    declared_size INTEGER NOT NULL CHECK (declared_size >= 0),
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'uploading', 'completed', 'failed', 'cancelled')),
    retrieval_ref TEXT,
    error_code TEXT,
    error_detail TEXT,
    backup_status TEXT NOT NULL DEFAULT 'none'
        CHECK (backup_status IN ('none', 'pending', 'completed', 'failed')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    cancelled_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_batch ON upload_sessions(batch_id);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status);
"#;
