use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::BucketId;
use crate::status::BucketStatus;

/// A logical grouping of source roots sharing one destination root, with its
/// own scheduler and worker cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub name: String,
    /// Ordered list of source roots; order determines drain order.
    pub source_folders: Vec<PathBuf>,
    pub destination_folder: PathBuf,
    pub worker_count: usize,
    pub status: BucketStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDraft {
    pub name: String,
    pub source_folders: Vec<PathBuf>,
    pub destination_folder: PathBuf,
    pub worker_count: usize,
}

impl BucketDraft {
    /// Structural validation shared by every creation path. Worker-cap
    /// clamping against service limits happens in the manager.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::InvalidBucket("name must not be empty".into()));
        }
        if self.source_folders.is_empty() {
            return Err(ModelError::InvalidBucket(
                "at least one source folder is required".into(),
            ));
        }
        if self.destination_folder.as_os_str().is_empty() {
            return Err(ModelError::InvalidBucket(
                "destination folder must not be empty".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ModelError::InvalidBucket(
                "worker count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Partial update applied to an existing bucket. `None` fields are left
/// untouched. Source and destination changes require a stopped scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketUpdate {
    pub name: Option<String>,
    pub source_folders: Option<Vec<PathBuf>>,
    pub destination_folder: Option<PathBuf>,
    pub worker_count: Option<usize>,
}

impl BucketUpdate {
    /// True when the update touches fields that are only mutable while the
    /// bucket's scheduler is stopped.
    pub fn requires_stopped(&self) -> bool {
        self.source_folders.is_some() || self.destination_folder.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.source_folders.is_none()
            && self.destination_folder.is_none()
            && self.worker_count.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> BucketDraft {
        BucketDraft {
            name: "media".into(),
            source_folders: vec![PathBuf::from("/srv/a")],
            destination_folder: PathBuf::from("/mnt/backup"),
            worker_count: 2,
        }
    }

    #[test]
    fn valid_draft_passes() {
        assert!(draft().validate().is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        let mut d = draft();
        d.name = "  ".into();
        assert!(d.validate().is_err());
    }

    #[test]
    fn missing_sources_rejected() {
        let mut d = draft();
        d.source_folders.clear();
        assert!(d.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut d = draft();
        d.worker_count = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn update_stopped_requirement() {
        let update = BucketUpdate {
            worker_count: Some(4),
            ..Default::default()
        };
        assert!(!update.requires_stopped());

        let update = BucketUpdate {
            source_folders: Some(vec![PathBuf::from("/srv/b")]),
            ..Default::default()
        };
        assert!(update.requires_stopped());
    }
}
