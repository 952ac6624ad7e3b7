use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BucketId, FileId};
use crate::status::FileStatus;

/// Durable record of one file awaiting or completing replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub bucket_id: BucketId,
    pub source_path: PathBuf,
    /// The source root this file was enumerated under.
    pub source_folder: PathBuf,
    /// Path relative to `source_folder`, preserved under the destination root.
    pub relative_path: PathBuf,
    pub destination_path: PathBuf,
    /// Size in bytes observed at scan time.
    pub file_size: u64,
    pub status: FileStatus,
    pub source_hash: Option<String>,
    pub destination_hash: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Row handed to the store by the scanner. The destination path mirrors the
/// source structure: `destination_root + relative(source_root, source_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFileEntry {
    pub source_path: PathBuf,
    pub source_folder: PathBuf,
    pub relative_path: PathBuf,
    pub destination_path: PathBuf,
    pub file_size: u64,
    /// `Pending` unless the scanner's opt-in fast path marked the row
    /// pre-completed. Only those two values are meaningful here.
    pub initial_status: FileStatus,
}

impl NewFileEntry {
    /// Build a pending entry for `source_path` under `source_root`, mirrored
    /// beneath `destination_root`. Returns `None` when `source_path` is not
    /// inside `source_root`.
    pub fn mirrored(
        source_root: &Path,
        source_path: &Path,
        destination_root: &Path,
        file_size: u64,
    ) -> Option<Self> {
        let relative = source_path.strip_prefix(source_root).ok()?;
        Some(Self {
            source_path: source_path.to_path_buf(),
            source_folder: source_root.to_path_buf(),
            relative_path: relative.to_path_buf(),
            destination_path: destination_root.join(relative),
            file_size,
            initial_status: FileStatus::Pending,
        })
    }
}
