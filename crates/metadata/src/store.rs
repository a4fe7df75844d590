//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::PurgeStats;
use crate::repos::{FileRepo, LedgerRepo, LockRepo, TaskRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: TaskRepo + LedgerRepo + LockRepo + FileRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Delete every row whose retention ended before `now`.
    async fn purge_expired(&self, now: OffsetDateTime) -> MetadataResult<PurgeStats> {
        let tasks = self.delete_expired_tasks(now).await?;
        let (chunks, progress) = self.purge_expired_ledger(now).await?;
        let locks = self.purge_expired_locks(now).await?;
        Ok(PurgeStats {
            tasks,
            chunks,
            progress,
            locks,
        })
    }
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate a SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(600));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite serializes writers anyway, and a single
        // connection keeps compare-and-set updates free of SQLITE_BUSY.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout,
        };
        store.migrate().await?;

        tracing::info!(path = %path.display(), "Metadata store ready");
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
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        tokio::time::timeout(self.query_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| {
                MetadataError::Internal(format!(
                    "health check exceeded {}s",
                    self.query_timeout.as_secs()
                ))
            })??;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use uuid::Uuid;

    const ACTIVE_STATUSES: &str = "('initialized', 'checking', 'uploading', 'paused', 'merging')";
    const ACCEPTING_STATUSES: &str = "('uploading', 'paused')";
    /// A recorded chunk may still be counting its bytes when the last chunk
    /// moves the task to merging.
    const COUNTING_STATUSES: &str = "('uploading', 'paused', 'merging')";

    #[async_trait]
    impl TaskRepo for SqliteStore {
        async fn create_task(&self, task: &TaskRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO transfer_tasks (
                    task_id, user_id, file_name, object_key, upload_id,
                    total_size, content_hash, chunk_size, total_chunks, uploaded_chunks,
                    mime_type, platform, status, error_message,
                    created_at, started_at, completed_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.task_id)
            .bind(&task.user_id)
            .bind(&task.file_name)
            .bind(&task.object_key)
            .bind(&task.upload_id)
            .bind(task.total_size)
            .bind(&task.content_hash)
            .bind(task.chunk_size)
            .bind(task.total_chunks)
            .bind(task.uploaded_chunks)
            .bind(&task.mime_type)
            .bind(&task.platform)
            .bind(&task.status)
            .bind(&task.error_message)
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.updated_at)
            .bind(task.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::from_insert(e, || format!("task {}", task.task_id)))?;
            Ok(())
        }

        async fn get_task(&self, task_id: Uuid) -> MetadataResult<Option<TaskRow>> {
            let row =
                sqlx::query_as::<_, TaskRow>("SELECT * FROM transfer_tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn compare_and_set_status(
            &self,
            task_id: Uuid,
            from: &str,
            to: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE transfer_tasks SET status = ?, updated_at = ? WHERE task_id = ? AND status = ?",
            )
            .bind(to)
            .bind(updated_at)
            .bind(task_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn begin_upload(
            &self,
            task_id: Uuid,
            upload_id: &str,
            started_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET status = 'uploading', upload_id = ?, started_at = ?, updated_at = ?
                WHERE task_id = ? AND status = 'checking'
                "#,
            )
            .bind(upload_id)
            .bind(started_at)
            .bind(started_at)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn complete_task(
            &self,
            task_id: Uuid,
            from: &str,
            completed_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET status = 'completed', completed_at = ?, updated_at = ?,
                    uploaded_chunks = total_chunks
                WHERE task_id = ? AND status = ?
                "#,
            )
            .bind(completed_at)
            .bind(completed_at)
            .bind(task_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn fail_task(
            &self,
            task_id: Uuid,
            error_message: &str,
            expires_at: OffsetDateTime,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let sql = format!(
                "UPDATE transfer_tasks SET status = 'failed', error_message = ?, expires_at = ?, updated_at = ? \
                 WHERE task_id = ? AND status IN {ACTIVE_STATUSES}"
            );
            let result = sqlx::query(&sql)
                .bind(error_message)
                .bind(expires_at)
                .bind(updated_at)
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn update_uploaded_chunks(
            &self,
            task_id: Uuid,
            uploaded_chunks: u32,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET uploaded_chunks = MAX(uploaded_chunks, ?), updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(i64::from(uploaded_chunks))
            .bind(updated_at)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_expired_tasks(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM transfer_tasks WHERE julianday(expires_at) <= julianday(?)")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn count_active_tasks(&self) -> MetadataResult<u64> {
            let sql = format!("SELECT COUNT(*) FROM transfer_tasks WHERE status IN {ACTIVE_STATUSES}");
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl LedgerRepo for SqliteStore {
        async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<bool> {
            // An expired row for the same index counts as absent and is replaced.
            // Nothing is written once the task stops accepting chunks.
            let sql = format!(
                r#"
                INSERT INTO task_chunks (
                    task_id, chunk_index, size, chunk_hash, part_id, recorded_at, expires_at
                )
                SELECT ?, ?, ?, ?, ?, ?, ?
                WHERE EXISTS (
                    SELECT 1 FROM transfer_tasks
                    WHERE task_id = ? AND status IN {ACCEPTING_STATUSES}
                )
                ON CONFLICT(task_id, chunk_index) DO UPDATE SET
                    size = excluded.size,
                    chunk_hash = excluded.chunk_hash,
                    part_id = excluded.part_id,
                    recorded_at = excluded.recorded_at,
                    expires_at = excluded.expires_at
                WHERE julianday(task_chunks.expires_at) <= julianday(excluded.recorded_at)
                "#
            );
            let result = sqlx::query(&sql)
                .bind(chunk.task_id)
                .bind(chunk.chunk_index)
                .bind(chunk.size)
                .bind(&chunk.chunk_hash)
                .bind(&chunk.part_id)
                .bind(chunk.recorded_at)
                .bind(chunk.expires_at)
                .bind(chunk.task_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_chunk(
            &self,
            task_id: Uuid,
            chunk_index: u32,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                "SELECT * FROM task_chunks WHERE task_id = ? AND chunk_index = ? AND julianday(expires_at) > julianday(?)",
            )
            .bind(task_id)
            .bind(i64::from(chunk_index))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_chunks(
            &self,
            task_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<ChunkRow>> {
            let rows = sqlx::query_as::<_, ChunkRow>(
                "SELECT * FROM task_chunks WHERE task_id = ? AND julianday(expires_at) > julianday(?) ORDER BY chunk_index",
            )
            .bind(task_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_chunks(&self, task_id: Uuid, now: OffsetDateTime) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM task_chunks WHERE task_id = ? AND julianday(expires_at) > julianday(?)",
            )
            .bind(task_id)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }

        async fn start_progress(
            &self,
            task_id: Uuid,
            started_at: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO task_progress (task_id, transferred_bytes, started_at, updated_at, expires_at)
                VALUES (?, 0, ?, ?, ?)
                ON CONFLICT(task_id) DO NOTHING
                "#,
            )
            .bind(task_id)
            .bind(started_at)
            .bind(started_at)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn add_bytes(
            &self,
            task_id: Uuid,
            delta: u64,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<Option<u64>> {
            let delta = i64::try_from(delta)
                .map_err(|_| MetadataError::Internal(format!("byte delta {delta} out of range")))?;
            let sql = format!(
                r#"
                INSERT INTO task_progress (task_id, transferred_bytes, started_at, updated_at, expires_at)
                SELECT ?, ?, ?, ?, ?
                WHERE EXISTS (
                    SELECT 1 FROM transfer_tasks
                    WHERE task_id = ? AND status IN {COUNTING_STATUSES}
                )
                ON CONFLICT(task_id) DO UPDATE SET
                    transferred_bytes = task_progress.transferred_bytes + excluded.transferred_bytes,
                    updated_at = excluded.updated_at
                RETURNING transferred_bytes
                "#
            );
            let total: Option<i64> = sqlx::query_scalar(&sql)
                .bind(task_id)
                .bind(delta)
                .bind(now)
                .bind(now)
                .bind(expires_at)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(total.map(|t| t as u64))
        }

        async fn get_progress(
            &self,
            task_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<ProgressRow>> {
            let row = sqlx::query_as::<_, ProgressRow>(
                "SELECT * FROM task_progress WHERE task_id = ? AND julianday(expires_at) > julianday(?)",
            )
            .bind(task_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn set_ledger_expiry(
            &self,
            task_id: Uuid,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE task_chunks SET expires_at = ? WHERE task_id = ?")
                .bind(expires_at)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE task_progress SET expires_at = ? WHERE task_id = ?")
                .bind(expires_at)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn clear_ledger(&self, task_id: Uuid) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM task_chunks WHERE task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM task_progress WHERE task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn purge_expired_ledger(&self, now: OffsetDateTime) -> MetadataResult<(u64, u64)> {
            let mut tx = self.pool.begin().await?;
            let chunks = sqlx::query("DELETE FROM task_chunks WHERE julianday(expires_at) <= julianday(?)")
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let progress = sqlx::query("DELETE FROM task_progress WHERE julianday(expires_at) <= julianday(?)")
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok((chunks, progress))
        }
    }

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_acquire_lock(
            &self,
            task_id: Uuid,
            holder: Uuid,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO task_locks (task_id, holder, acquired_at, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE julianday(task_locks.expires_at) <= julianday(excluded.acquired_at)
                "#,
            )
            .bind(task_id)
            .bind(holder)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn release_lock(&self, task_id: Uuid, holder: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM task_locks WHERE task_id = ? AND holder = ?")
                .bind(task_id)
                .bind(holder)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_lock(&self, task_id: Uuid) -> MetadataResult<Option<LockRow>> {
            let row = sqlx::query_as::<_, LockRow>("SELECT * FROM task_locks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn purge_expired_locks(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM task_locks WHERE julianday(expires_at) <= julianday(?)")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn create_file(&self, file: &FileRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO files (
                    file_id, user_id, file_name, object_key, size,
                    content_hash, mime_type, platform, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(file.file_id)
            .bind(&file.user_id)
            .bind(&file.file_name)
            .bind(&file.object_key)
            .bind(file.size)
            .bind(&file.content_hash)
            .bind(&file.mime_type)
            .bind(&file.platform)
            .bind(file.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::from_insert(e, || format!("file {}", file.file_id)))?;
            Ok(())
        }

        async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_by_content_hash(
            &self,
            user_id: &str,
            content_hash: &str,
        ) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE user_id = ? AND content_hash = ? ORDER BY julianday(created_at) DESC LIMIT 1",
            )
            .bind(user_id)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn delete_file(&self, file_id: Uuid) -> MetadataResult<()> {
            let result = sqlx::query("DELETE FROM files WHERE file_id = ?")
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file_id {file_id} not found")));
            }
            Ok(())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Transfer tasks
CREATE TABLE IF NOT EXISTS transfer_tasks (
    task_id BLOB PRIMARY KEY,
    user_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    object_key TEXT NOT NULL,
    upload_id TEXT,
    total_size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    chunk_size INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    uploaded_chunks INTEGER NOT NULL DEFAULT 0,
    mime_type TEXT,
    platform TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'initialized',
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfer_tasks_user ON transfer_tasks(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_transfer_tasks_status ON transfer_tasks(status, expires_at);

-- Completed chunks
CREATE TABLE IF NOT EXISTS task_chunks (
    task_id BLOB NOT NULL,
    chunk_index INTEGER NOT NULL,
    size INTEGER NOT NULL,
    chunk_hash TEXT NOT NULL,
    part_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (task_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_task_chunks_expires ON task_chunks(expires_at);

-- Transferred bytes and start time
CREATE TABLE IF NOT EXISTS task_progress (
    task_id BLOB PRIMARY KEY,
    transferred_bytes INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Leased merge locks
CREATE TABLE IF NOT EXISTS task_locks (
    task_id BLOB PRIMARY KEY,
    holder BLOB NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Finalized files
CREATE TABLE IF NOT EXISTS files (
    file_id BLOB PRIMARY KEY,
    user_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    object_key TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    mime_type TEXT,
    platform TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_user_hash ON files(user_id, content_hash);
"#;
