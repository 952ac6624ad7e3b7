//! SQLite-backed durable queue store.
//!
//! Sole authority on durable state: buckets, file-queue rows, and service
//! state all mutate through here, each operation in one transaction. The
//! in-memory [`StatsLedger`] is adjusted only after a transaction commits,
//! while still holding the store's write serialization, so ledger and durable
//! state agree at every commit-quiescent point.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::FromRow;
use tracing::{debug, info};

use mirrex_model::{
    Bucket, BucketDraft, BucketId, BucketStatus, BucketUpdate, FileEntry,
    FileId, FileStatus, NewFileEntry,
};

use crate::error::{CoreError, Result};
use crate::replication::config::ReplicationConfig;
use crate::replication::ledger::{
    LedgerRow, StatsLedger, StatsSnapshot, StatusBreakdown, StatusTotals,
};

const SCHEMA_VERSION: i64 = 1;
const SCHEMA_VERSION_KEY: &str = "schema_version";

const CREATE_SERVICE_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS service_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

// Applied when schema_version is 0. Later versions append further steps.
const MIGRATION_V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS buckets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        source_folders TEXT NOT NULL,
        destination_folder TEXT NOT NULL,
        worker_count INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bucket_id INTEGER NOT NULL REFERENCES buckets(id) ON DELETE CASCADE,
        source_path TEXT NOT NULL,
        source_folder TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        destination_path TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        source_hash TEXT,
        destination_hash TEXT,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        worker_id INTEGER,
        UNIQUE(source_path, destination_path, bucket_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_file_queue_claim
        ON file_queue(bucket_id, status, source_folder, id)",
    "CREATE INDEX IF NOT EXISTS idx_file_queue_status_updated
        ON file_queue(status, updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_file_queue_bucket_updated
        ON file_queue(bucket_id, updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_file_queue_updated
        ON file_queue(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_file_queue_source_folder
        ON file_queue(source_folder)",
];

const FILE_QUEUE_COLUMNS: &str = "id, bucket_id, source_path, source_folder, \
    relative_path, destination_path, file_size, source_hash, destination_hash, \
    status, error_message, created_at, updated_at, started_at, completed_at, \
    worker_id";

// SQLite extended error code for UNIQUE constraint violations.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Operator decision applied to a row in `conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Re-queue the row so the next copy overwrites the destination.
    Overwrite,
    /// Keep the destination as-is and mark the row completed.
    Skip,
}

/// Terminal transition applied by [`QueueStore::commit_outcome`].
#[derive(Debug, Clone)]
pub struct EntryCommit {
    pub status: FileStatus,
    pub source_hash: Option<String>,
    pub destination_hash: Option<String>,
    pub error_message: Option<String>,
}

/// Pending/in-progress totals for one source folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderActivity {
    pub pending: u64,
    pub in_progress: u64,
}

impl FolderActivity {
    pub fn is_active(&self) -> bool {
        self.pending > 0 || self.in_progress > 0
    }
}

/// Per-folder breakdown by status, served from a short-TTL cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderStats {
    pub folder: String,
    pub breakdown: StatusBreakdown,
}

#[derive(Debug, FromRow)]
struct BucketRow {
    id: i64,
    name: String,
    source_folders: String,
    destination_folder: String,
    worker_count: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BucketRow {
    fn into_bucket(self) -> Result<Bucket> {
        let folders: Vec<String> = serde_json::from_str(&self.source_folders)?;
        Ok(Bucket {
            id: BucketId(self.id),
            name: self.name,
            source_folders: folders.into_iter().map(PathBuf::from).collect(),
            destination_folder: PathBuf::from(self.destination_folder),
            worker_count: self.worker_count.max(1) as usize,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileQueueRow {
    id: i64,
    bucket_id: i64,
    source_path: String,
    source_folder: String,
    relative_path: String,
    destination_path: String,
    file_size: i64,
    source_hash: Option<String>,
    destination_hash: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    worker_id: Option<i64>,
}

impl FileQueueRow {
    fn into_entry(self) -> Result<FileEntry> {
        Ok(FileEntry {
            id: FileId(self.id),
            bucket_id: BucketId(self.bucket_id),
            source_path: PathBuf::from(self.source_path),
            source_folder: PathBuf::from(self.source_folder),
            relative_path: PathBuf::from(self.relative_path),
            destination_path: PathBuf::from(self.destination_path),
            file_size: self.file_size.max(0) as u64,
            status: self.status.parse()?,
            source_hash: self.source_hash,
            destination_hash: self.destination_hash,
            error_message: self.error_message,
            worker_id: self.worker_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct GroupCountRow {
    bucket_id: i64,
    count: i64,
    total_size: i64,
}

#[derive(Debug, FromRow)]
struct LedgerGroupRow {
    bucket_id: i64,
    status: String,
    count: i64,
    total_size: i64,
}

#[derive(Debug, FromRow)]
struct FolderStatusRow {
    source_folder: String,
    status: String,
    count: i64,
    total_size: i64,
}

type FolderStatsCache = HashMap<i64, (Instant, Arc<Vec<FolderStats>>)>;

/// Durable queue backed by an embedded SQLite database.
pub struct QueueStore {
    pool: SqlitePool,
    ledger: StatsLedger,
    /// Serializes mutating operations so post-commit ledger deltas are
    /// applied in commit order.
    write_lock: tokio::sync::Mutex<()>,
    folder_cache_ttl: Duration,
    folder_stats_cache: parking_lot::Mutex<FolderStatsCache>,
}

impl fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("ledger", &self.ledger)
            .finish()
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl QueueStore {
    /// Open (creating if missing) the queue database, apply pending schema
    /// migrations, run crash recovery, and prime the stats ledger.
    pub async fn open(path: &Path, config: &ReplicationConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            ledger: StatsLedger::new(),
            write_lock: tokio::sync::Mutex::new(()),
            folder_cache_ttl: config.folder_cache_ttl(),
            folder_stats_cache: parking_lot::Mutex::new(HashMap::new()),
        };

        store.migrate().await?;
        let recovered = store.recover_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "recovered interrupted queue rows to pending");
        }
        store.rebuild_ledger().await?;
        Ok(store)
    }

    /// Close the underlying pool. Pending acquires fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_SERVICE_STATE)
            .execute(&self.pool)
            .await?;

        let mut version = self.schema_version().await?;
        while version < SCHEMA_VERSION {
            let mut tx = self.pool.begin().await?;
            match version {
                0 => {
                    for statement in MIGRATION_V1 {
                        sqlx::query(statement).execute(&mut *tx).await?;
                    }
                }
                other => {
                    return Err(CoreError::Internal(format!(
                        "no migration path from schema version {other}"
                    )));
                }
            }
            version += 1;
            upsert_service_value(
                &mut tx,
                SCHEMA_VERSION_KEY,
                &version.to_string(),
            )
            .await?;
            tx.commit().await?;
            info!(version, "applied queue schema migration");
        }
        Ok(())
    }

    /// Current schema version; 0 before the first migration.
    pub async fn schema_version(&self) -> Result<i64> {
        match self.service_value(SCHEMA_VERSION_KEY).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| {
                CoreError::Internal(format!(
                    "corrupt schema_version value: {raw}"
                ))
            }),
        }
    }

    pub async fn service_value(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM service_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|(value,)| value))
    }

    pub async fn set_service_value(&self, key: &str, value: &str) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        upsert_service_value(&mut tx, key, value).await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- bucket CRUD ----------------------------------------------------

    pub async fn create_bucket(&self, draft: &BucketDraft) -> Result<Bucket> {
        draft.validate()?;
        let _write = self.write_lock.lock().await;
        let now = Utc::now();
        let folders: Vec<String> =
            draft.source_folders.iter().map(|p| path_str(p)).collect();
        let folders_json = serde_json::to_string(&folders)?;

        let result = sqlx::query(
            "INSERT INTO buckets \
             (name, source_folders, destination_folder, worker_count, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&draft.name)
        .bind(&folders_json)
        .bind(path_str(&draft.destination_folder))
        .bind(draft.worker_count as i64)
        .bind(BucketStatus::Stopped.as_str())
        .bind(now)
        .execute(&self.pool)
        .await;

        let done = match result {
            Ok(done) => done,
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE) =>
            {
                return Err(CoreError::Validation(format!(
                    "bucket name '{}' already in use",
                    draft.name
                )));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Bucket {
            id: BucketId(done.last_insert_rowid()),
            name: draft.name.clone(),
            source_folders: draft.source_folders.clone(),
            destination_folder: draft.destination_folder.clone(),
            worker_count: draft.worker_count,
            status: BucketStatus::Stopped,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn bucket(&self, id: BucketId) -> Result<Bucket> {
        let row: Option<BucketRow> =
            sqlx::query_as("SELECT * FROM buckets WHERE id = ?1")
                .bind(id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| CoreError::NotFound(format!("bucket {id}")))?
            .into_bucket()
    }

    pub async fn bucket_by_name(&self, name: &str) -> Result<Option<Bucket>> {
        let row: Option<BucketRow> =
            sqlx::query_as("SELECT * FROM buckets WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(BucketRow::into_bucket).transpose()
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let rows: Vec<BucketRow> =
            sqlx::query_as("SELECT * FROM buckets ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(BucketRow::into_bucket).collect()
    }

    /// Apply a partial update. Status-dependent rules (sources/destination
    /// only while stopped) are the manager's responsibility.
    pub async fn update_bucket(
        &self,
        id: BucketId,
        update: &BucketUpdate,
    ) -> Result<Bucket> {
        let _write = self.write_lock.lock().await;
        let mut bucket = self.bucket(id).await?;

        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(CoreError::Validation(
                    "bucket name must not be empty".into(),
                ));
            }
            bucket.name = name.clone();
        }
        if let Some(folders) = &update.source_folders {
            if folders.is_empty() {
                return Err(CoreError::Validation(
                    "at least one source folder is required".into(),
                ));
            }
            bucket.source_folders = folders.clone();
        }
        if let Some(destination) = &update.destination_folder {
            bucket.destination_folder = destination.clone();
        }
        if let Some(worker_count) = update.worker_count {
            if worker_count == 0 {
                return Err(CoreError::Validation(
                    "worker count must be at least 1".into(),
                ));
            }
            bucket.worker_count = worker_count;
        }
        bucket.updated_at = Utc::now();

        let folders: Vec<String> =
            bucket.source_folders.iter().map(|p| path_str(p)).collect();
        let result = sqlx::query(
            "UPDATE buckets SET name = ?1, source_folders = ?2, \
             destination_folder = ?3, worker_count = ?4, updated_at = ?5 \
             WHERE id = ?6",
        )
        .bind(&bucket.name)
        .bind(serde_json::to_string(&folders)?)
        .bind(path_str(&bucket.destination_folder))
        .bind(bucket.worker_count as i64)
        .bind(bucket.updated_at)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(bucket),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE) =>
            {
                Err(CoreError::Validation(format!(
                    "bucket name '{}' already in use",
                    bucket.name
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn set_bucket_status(
        &self,
        id: BucketId,
        status: BucketStatus,
    ) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let done = sqlx::query(
            "UPDATE buckets SET status = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("bucket {id}")));
        }
        Ok(())
    }

    /// Delete a bucket and every queue row it owns. The ledger delta for the
    /// cascade is read in the same transaction as the delete.
    pub async fn delete_bucket(&self, id: BucketId) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM buckets WHERE id = ?1")
                .bind(id.as_i64())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(CoreError::NotFound(format!("bucket {id}")));
        }

        sqlx::query("DELETE FROM file_queue WHERE bucket_id = ?1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.ledger.remove_bucket(id);
        self.invalidate_folder_cache(id);
        Ok(())
    }

    // ---- queue rows -----------------------------------------------------

    /// Bulk insert with dedup on (source_path, destination_path, bucket_id);
    /// reinsertion of an existing triple is a no-op. Returns the number of
    /// rows actually added.
    pub async fn insert_files(
        &self,
        bucket_id: BucketId,
        rows: &[NewFileEntry],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        // Surfaces NotFound before the FK would.
        self.bucket(bucket_id).await?;

        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut added_pending = (0u64, 0u64);
        let mut added_completed = (0u64, 0u64);

        for row in rows {
            // Only the scanner's opt-in fast path may pre-complete a row.
            let status = if row.initial_status == FileStatus::Completed {
                FileStatus::Completed
            } else {
                FileStatus::Pending
            };
            let completed_at =
                (status == FileStatus::Completed).then_some(now);

            let done = sqlx::query(
                "INSERT OR IGNORE INTO file_queue \
                 (bucket_id, source_path, source_folder, relative_path, \
                  destination_path, file_size, status, created_at, updated_at, \
                  completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
            )
            .bind(bucket_id.as_i64())
            .bind(path_str(&row.source_path))
            .bind(path_str(&row.source_folder))
            .bind(path_str(&row.relative_path))
            .bind(path_str(&row.destination_path))
            .bind(row.file_size as i64)
            .bind(status.as_str())
            .bind(now)
            .bind(completed_at)
            .execute(&mut *tx)
            .await?;

            if done.rows_affected() == 1 {
                let tally = if status == FileStatus::Completed {
                    &mut added_completed
                } else {
                    &mut added_pending
                };
                tally.0 += 1;
                tally.1 += row.file_size;
            }
        }
        tx.commit().await?;

        self.ledger.record_added(
            bucket_id,
            FileStatus::Pending,
            added_pending.0,
            added_pending.1,
        );
        self.ledger.record_added(
            bucket_id,
            FileStatus::Completed,
            added_completed.0,
            added_completed.1,
        );
        self.invalidate_folder_cache(bucket_id);

        let added = added_pending.0 + added_completed.0;
        debug!(bucket = %bucket_id, added, skipped = rows.len() as u64 - added, "inserted queue rows");
        Ok(added)
    }

    /// Claim up to `limit` pending rows in FIFO (ascending id) order,
    /// optionally restricted to one source folder. Each row transitions
    /// pending → in_progress guarded by its current status; rows that were
    /// stolen or removed in the meantime are skipped silently.
    pub async fn claim_pending(
        &self,
        bucket_id: BucketId,
        folder: Option<&Path>,
        limit: usize,
        worker_id: i64,
    ) -> Result<Vec<FileEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<FileQueueRow> = match folder {
            Some(folder) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE bucket_id = ?1 AND status = ?2 AND source_folder = ?3 \
                     ORDER BY id ASC LIMIT ?4"
                ))
                .bind(bucket_id.as_i64())
                .bind(FileStatus::Pending.as_str())
                .bind(path_str(folder))
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE bucket_id = ?1 AND status = ?2 \
                     ORDER BY id ASC LIMIT ?3"
                ))
                .bind(bucket_id.as_i64())
                .bind(FileStatus::Pending.as_str())
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        let mut claimed_size = 0u64;

        for row in candidates {
            let done = sqlx::query(
                "UPDATE file_queue \
                 SET status = ?1, worker_id = ?2, started_at = ?3, updated_at = ?3 \
                 WHERE id = ?4 AND status = ?5",
            )
            .bind(FileStatus::InProgress.as_str())
            .bind(worker_id)
            .bind(now)
            .bind(row.id)
            .bind(FileStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

            if done.rows_affected() == 1 {
                let mut entry = row.into_entry()?;
                entry.status = FileStatus::InProgress;
                entry.worker_id = Some(worker_id);
                entry.started_at = Some(now);
                entry.updated_at = now;
                claimed_size += entry.file_size;
                claimed.push(entry);
            }
        }
        tx.commit().await?;

        self.ledger.record_transition(
            bucket_id,
            FileStatus::Pending,
            FileStatus::InProgress,
            claimed.len() as u64,
            claimed_size,
        );
        if !claimed.is_empty() {
            self.invalidate_folder_cache(bucket_id);
        }
        Ok(claimed)
    }

    /// Move an `in_progress` row to its terminal status. The row's current
    /// status is read in the same transaction so the ledger delta is correct.
    pub async fn commit_outcome(
        &self,
        file_id: FileId,
        commit: EntryCommit,
    ) -> Result<FileEntry> {
        if !commit.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "commit status must be terminal, got {}",
                commit.status
            )));
        }

        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<FileQueueRow> = sqlx::query_as(&format!(
            "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue WHERE id = ?1"
        ))
        .bind(file_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;
        let row =
            row.ok_or_else(|| CoreError::NotFound(format!("queue entry {file_id}")))?;
        let prior: FileStatus = row.status.parse()?;
        if prior != FileStatus::InProgress {
            return Err(CoreError::InvalidState(format!(
                "queue entry {file_id} is {prior}, not in_progress"
            )));
        }

        let now = Utc::now();
        let completed_at =
            (commit.status == FileStatus::Completed).then_some(now);
        sqlx::query(
            "UPDATE file_queue \
             SET status = ?1, source_hash = ?2, destination_hash = ?3, \
                 error_message = ?4, completed_at = ?5, updated_at = ?6 \
             WHERE id = ?7 AND status = ?8",
        )
        .bind(commit.status.as_str())
        .bind(&commit.source_hash)
        .bind(&commit.destination_hash)
        .bind(&commit.error_message)
        .bind(completed_at)
        .bind(now)
        .bind(file_id.as_i64())
        .bind(FileStatus::InProgress.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut entry = row.into_entry()?;
        let bucket_id = entry.bucket_id;
        let file_size = entry.file_size;
        entry.status = commit.status;
        entry.source_hash = commit.source_hash;
        entry.destination_hash = commit.destination_hash;
        entry.error_message = commit.error_message;
        entry.completed_at = completed_at;
        entry.updated_at = now;

        self.ledger.record_transition(
            bucket_id,
            FileStatus::InProgress,
            commit.status,
            1,
            file_size,
        );
        self.invalidate_folder_cache(bucket_id);
        Ok(entry)
    }

    /// Apply an operator decision to one conflicted row. Returns the updated
    /// entry, or `None` (silently) when the row is not in `conflict`.
    pub async fn resolve_conflict(
        &self,
        file_id: FileId,
        action: ConflictAction,
    ) -> Result<Option<FileEntry>> {
        self.resolve_conflict_scoped(file_id, None, action).await
    }

    /// Bucket-scoped variant used by the control plane: the lookup matches
    /// on (id, bucket_id) so a row id from another bucket cannot be resolved
    /// through the wrong endpoint.
    pub async fn resolve_conflict_in_bucket(
        &self,
        bucket_id: BucketId,
        file_id: FileId,
        action: ConflictAction,
    ) -> Result<Option<FileEntry>> {
        self.resolve_conflict_scoped(file_id, Some(bucket_id), action)
            .await
    }

    async fn resolve_conflict_scoped(
        &self,
        file_id: FileId,
        bucket_id: Option<BucketId>,
        action: ConflictAction,
    ) -> Result<Option<FileEntry>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<FileQueueRow> = match bucket_id {
            Some(bucket_id) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE id = ?1 AND bucket_id = ?2 AND status = ?3"
                ))
                .bind(file_id.as_i64())
                .bind(bucket_id.as_i64())
                .bind(FileStatus::Conflict.as_str())
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE id = ?1 AND status = ?2"
                ))
                .bind(file_id.as_i64())
                .bind(FileStatus::Conflict.as_str())
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let now = Utc::now();
        let target = match action {
            ConflictAction::Overwrite => FileStatus::Pending,
            ConflictAction::Skip => FileStatus::Completed,
        };
        match action {
            ConflictAction::Overwrite => {
                sqlx::query(
                    "UPDATE file_queue \
                     SET status = ?1, destination_hash = NULL, error_message = NULL, \
                         worker_id = NULL, started_at = NULL, completed_at = NULL, \
                         updated_at = ?2 \
                     WHERE id = ?3 AND status = ?4",
                )
                .bind(target.as_str())
                .bind(now)
                .bind(row.id)
                .bind(FileStatus::Conflict.as_str())
                .execute(&mut *tx)
                .await?;
            }
            ConflictAction::Skip => {
                sqlx::query(
                    "UPDATE file_queue \
                     SET status = ?1, completed_at = ?2, updated_at = ?2 \
                     WHERE id = ?3 AND status = ?4",
                )
                .bind(target.as_str())
                .bind(now)
                .bind(row.id)
                .bind(FileStatus::Conflict.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        let mut entry = row.into_entry()?;
        let bucket = entry.bucket_id;
        let file_size = entry.file_size;
        entry.status = target;
        entry.updated_at = now;
        match action {
            ConflictAction::Overwrite => {
                entry.destination_hash = None;
                entry.error_message = None;
                entry.worker_id = None;
                entry.started_at = None;
                entry.completed_at = None;
            }
            ConflictAction::Skip => {
                entry.completed_at = Some(now);
            }
        }

        self.ledger.record_transition(
            bucket,
            FileStatus::Conflict,
            target,
            1,
            file_size,
        );
        self.invalidate_folder_cache(bucket);
        Ok(Some(entry))
    }

    /// Apply one action to every conflicted row, optionally restricted to a
    /// bucket. Returns the transitioned rows (read in the same transaction
    /// as the update, so callers can act on exactly the affected set).
    pub async fn resolve_conflicts_bulk(
        &self,
        bucket_id: Option<BucketId>,
        action: ConflictAction,
    ) -> Result<Vec<FileEntry>> {
        let target = match action {
            ConflictAction::Overwrite => FileStatus::Pending,
            ConflictAction::Skip => FileStatus::Completed,
        };
        let set_clause = match action {
            ConflictAction::Overwrite => {
                "status = ?1, destination_hash = NULL, error_message = NULL, \
                 worker_id = NULL, started_at = NULL, completed_at = NULL, \
                 updated_at = ?2"
            }
            ConflictAction::Skip => {
                "status = ?1, completed_at = ?2, updated_at = ?2"
            }
        };
        self.bulk_transition(bucket_id, FileStatus::Conflict, target, set_clause)
            .await
    }

    /// Re-queue one errored row. Returns the updated entry, or `None` when
    /// the row is not in `error`.
    pub async fn retry_error(&self, file_id: FileId) -> Result<Option<FileEntry>> {
        self.retry_error_scoped(file_id, None).await
    }

    /// Bucket-scoped retry used by the control plane.
    pub async fn retry_error_in_bucket(
        &self,
        bucket_id: BucketId,
        file_id: FileId,
    ) -> Result<Option<FileEntry>> {
        self.retry_error_scoped(file_id, Some(bucket_id)).await
    }

    async fn retry_error_scoped(
        &self,
        file_id: FileId,
        bucket_id: Option<BucketId>,
    ) -> Result<Option<FileEntry>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<FileQueueRow> = match bucket_id {
            Some(bucket_id) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE id = ?1 AND bucket_id = ?2 AND status = ?3"
                ))
                .bind(file_id.as_i64())
                .bind(bucket_id.as_i64())
                .bind(FileStatus::Error.as_str())
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE id = ?1 AND status = ?2"
                ))
                .bind(file_id.as_i64())
                .bind(FileStatus::Error.as_str())
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE file_queue \
             SET status = ?1, source_hash = NULL, destination_hash = NULL, \
                 error_message = NULL, worker_id = NULL, started_at = NULL, \
                 completed_at = NULL, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
        )
        .bind(FileStatus::Pending.as_str())
        .bind(now)
        .bind(row.id)
        .bind(FileStatus::Error.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut entry = row.into_entry()?;
        let bucket = entry.bucket_id;
        let file_size = entry.file_size;
        entry.status = FileStatus::Pending;
        entry.source_hash = None;
        entry.destination_hash = None;
        entry.error_message = None;
        entry.worker_id = None;
        entry.started_at = None;
        entry.completed_at = None;
        entry.updated_at = now;

        self.ledger.record_transition(
            bucket,
            FileStatus::Error,
            FileStatus::Pending,
            1,
            file_size,
        );
        self.invalidate_folder_cache(bucket);
        Ok(Some(entry))
    }

    /// Re-queue every errored row, optionally restricted to a bucket.
    pub async fn retry_errors_bulk(
        &self,
        bucket_id: Option<BucketId>,
    ) -> Result<Vec<FileEntry>> {
        self.bulk_transition(
            bucket_id,
            FileStatus::Error,
            FileStatus::Pending,
            "status = ?1, source_hash = NULL, destination_hash = NULL, \
             error_message = NULL, worker_id = NULL, started_at = NULL, \
             completed_at = NULL, updated_at = ?2",
        )
        .await
    }

    async fn bulk_transition(
        &self,
        bucket_id: Option<BucketId>,
        from: FileStatus,
        to: FileStatus,
        set_clause: &str,
    ) -> Result<Vec<FileEntry>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Read the affected set (and thus the ledger delta) in the same
        // transaction as the update.
        let rows: Vec<FileQueueRow> = match bucket_id {
            Some(bucket_id) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE status = ?1 AND bucket_id = ?2 ORDER BY id ASC"
                ))
                .bind(from.as_str())
                .bind(bucket_id.as_i64())
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE status = ?1 ORDER BY id ASC"
                ))
                .bind(from.as_str())
                .fetch_all(&mut *tx)
                .await?
            }
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        match bucket_id {
            Some(bucket_id) => {
                sqlx::query(&format!(
                    "UPDATE file_queue SET {set_clause} \
                     WHERE status = ?3 AND bucket_id = ?4"
                ))
                .bind(to.as_str())
                .bind(now)
                .bind(from.as_str())
                .bind(bucket_id.as_i64())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(&format!(
                    "UPDATE file_queue SET {set_clause} WHERE status = ?3"
                ))
                .bind(to.as_str())
                .bind(now)
                .bind(from.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        let mut affected = Vec::with_capacity(rows.len());
        let mut per_bucket: HashMap<i64, (u64, u64)> = HashMap::new();
        for row in rows {
            let mut entry = row.into_entry()?;
            let tally = per_bucket.entry(entry.bucket_id.as_i64()).or_default();
            tally.0 += 1;
            tally.1 += entry.file_size;
            entry.status = to;
            entry.updated_at = now;
            affected.push(entry);
        }
        for (bucket, (count, total_size)) in per_bucket {
            self.ledger.record_transition(
                BucketId(bucket),
                from,
                to,
                count,
                total_size,
            );
            self.invalidate_folder_cache(BucketId(bucket));
        }
        Ok(affected)
    }

    // ---- stats & listings -----------------------------------------------

    /// O(1) snapshot of the in-memory ledger.
    pub fn stats(&self, bucket_id: Option<BucketId>) -> StatsSnapshot {
        self.ledger.snapshot(bucket_id)
    }

    /// `{folder -> {pending, in_progress}}` for the scheduler's folder pick.
    pub async fn folder_active_counts(
        &self,
        bucket_id: BucketId,
    ) -> Result<BTreeMap<String, FolderActivity>> {
        let rows: Vec<FolderStatusRow> = sqlx::query_as(
            "SELECT source_folder, status, COUNT(*) AS count, \
             COALESCE(SUM(file_size), 0) AS total_size \
             FROM file_queue \
             WHERE bucket_id = ?1 AND status IN (?2, ?3) \
             GROUP BY source_folder, status",
        )
        .bind(bucket_id.as_i64())
        .bind(FileStatus::Pending.as_str())
        .bind(FileStatus::InProgress.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<String, FolderActivity> = BTreeMap::new();
        for row in rows {
            let entry = counts.entry(row.source_folder).or_default();
            match row.status.parse::<FileStatus>()? {
                FileStatus::Pending => entry.pending = row.count.max(0) as u64,
                FileStatus::InProgress => {
                    entry.in_progress = row.count.max(0) as u64
                }
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Per-folder breakdown by status, cached for a short TTL to absorb
    /// operator-driven polling. Any mutation to the bucket's rows drops the
    /// cached value early.
    pub async fn folder_stats_cached(
        &self,
        bucket_id: BucketId,
    ) -> Result<Arc<Vec<FolderStats>>> {
        {
            let cache = self.folder_stats_cache.lock();
            if let Some((at, stats)) = cache.get(&bucket_id.as_i64())
                && at.elapsed() < self.folder_cache_ttl
            {
                return Ok(Arc::clone(stats));
            }
        }

        let stats = Arc::new(self.folder_stats(bucket_id).await?);
        self.folder_stats_cache
            .lock()
            .insert(bucket_id.as_i64(), (Instant::now(), Arc::clone(&stats)));
        Ok(stats)
    }

    async fn folder_stats(&self, bucket_id: BucketId) -> Result<Vec<FolderStats>> {
        let rows: Vec<FolderStatusRow> = sqlx::query_as(
            "SELECT source_folder, status, COUNT(*) AS count, \
             COALESCE(SUM(file_size), 0) AS total_size \
             FROM file_queue WHERE bucket_id = ?1 \
             GROUP BY source_folder, status ORDER BY source_folder",
        )
        .bind(bucket_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let mut by_folder: BTreeMap<String, StatusBreakdown> = BTreeMap::new();
        for row in rows {
            let status: FileStatus = row.status.parse()?;
            let totals = StatusTotals {
                count: row.count.max(0) as u64,
                total_size: row.total_size.max(0) as u64,
            };
            let breakdown = by_folder.entry(row.source_folder).or_default();
            match status {
                FileStatus::Pending => breakdown.pending = totals,
                FileStatus::InProgress => breakdown.in_progress = totals,
                FileStatus::Completed => breakdown.completed = totals,
                FileStatus::Error => breakdown.error = totals,
                FileStatus::Conflict => breakdown.conflict = totals,
            }
        }

        Ok(by_folder
            .into_iter()
            .map(|(folder, breakdown)| FolderStats { folder, breakdown })
            .collect())
    }

    /// Fetch one row, scoped to its bucket.
    pub async fn entry_in_bucket(
        &self,
        bucket_id: BucketId,
        file_id: FileId,
    ) -> Result<Option<FileEntry>> {
        let row: Option<FileQueueRow> = sqlx::query_as(&format!(
            "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
             WHERE id = ?1 AND bucket_id = ?2"
        ))
        .bind(file_id.as_i64())
        .bind(bucket_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileQueueRow::into_entry).transpose()
    }

    /// Recent entries in one status for operator views, newest first.
    pub async fn entries_by_status(
        &self,
        bucket_id: Option<BucketId>,
        status: FileStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileEntry>> {
        let rows: Vec<FileQueueRow> = match bucket_id {
            Some(bucket_id) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE bucket_id = ?1 AND status = ?2 \
                     ORDER BY updated_at DESC LIMIT ?3 OFFSET ?4"
                ))
                .bind(bucket_id.as_i64())
                .bind(status.as_str())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_QUEUE_COLUMNS} FROM file_queue \
                     WHERE status = ?1 \
                     ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                ))
                .bind(status.as_str())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(FileQueueRow::into_entry).collect()
    }

    // ---- recovery & reconciliation --------------------------------------

    /// Crash recovery: flip every `in_progress` row back to `pending`,
    /// clearing worker stamps. Run once at startup before serving requests.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let groups: Vec<GroupCountRow> = sqlx::query_as(
            "SELECT bucket_id, COUNT(*) AS count, \
             COALESCE(SUM(file_size), 0) AS total_size \
             FROM file_queue WHERE status = ?1 GROUP BY bucket_id",
        )
        .bind(FileStatus::InProgress.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let done = sqlx::query(
            "UPDATE file_queue \
             SET status = ?1, worker_id = NULL, started_at = NULL, updated_at = ?2 \
             WHERE status = ?3",
        )
        .bind(FileStatus::Pending.as_str())
        .bind(Utc::now())
        .bind(FileStatus::InProgress.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        for group in groups {
            self.ledger.record_transition(
                BucketId(group.bucket_id),
                FileStatus::InProgress,
                FileStatus::Pending,
                group.count.max(0) as u64,
                group.total_size.max(0) as u64,
            );
            self.invalidate_folder_cache(BucketId(group.bucket_id));
        }
        Ok(done.rows_affected())
    }

    /// Rebuild the ledger from the ground-truth aggregate. A no-op under
    /// steady state; the oracle when divergence is suspected.
    pub async fn rebuild_ledger(&self) -> Result<()> {
        let rows: Vec<LedgerGroupRow> = sqlx::query_as(
            "SELECT bucket_id, status, COUNT(*) AS count, \
             COALESCE(SUM(file_size), 0) AS total_size \
             FROM file_queue GROUP BY bucket_id, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ledger_rows = Vec::with_capacity(rows.len());
        for row in rows {
            ledger_rows.push(LedgerRow {
                bucket_id: BucketId(row.bucket_id),
                status: row.status.parse()?,
                count: row.count.max(0) as u64,
                total_size: row.total_size.max(0) as u64,
            });
        }
        self.ledger.replace(ledger_rows);
        Ok(())
    }

    fn invalidate_folder_cache(&self, bucket_id: BucketId) {
        self.folder_stats_cache.lock().remove(&bucket_id.as_i64());
    }
}

async fn upsert_service_value(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
    value: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO service_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
         updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
