use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mirrex_model::{BucketId, BucketStatus, FileId, FileStatus};

use crate::error::Result;

/// Events the replication core publishes to external observers. Delivery is
/// best-effort and at-most-once per subscriber; the queue store remains the
/// ground truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReplicationEvent {
    /// A file row changed status.
    StatusChange {
        bucket_id: BucketId,
        file_id: FileId,
        status: FileStatus,
        source_path: String,
        timestamp: DateTime<Utc>,
    },
    /// Bytes moved for an in-flight copy. Heavily rate-limited and batchable.
    CopyProgress {
        bucket_id: BucketId,
        file_id: FileId,
        bytes_copied: u64,
        file_size: u64,
        percent: f64,
    },
    /// A bucket's scheduler changed shape or state.
    ServiceChange {
        bucket_id: BucketId,
        status: BucketStatus,
        worker_count: usize,
        active_workers: usize,
    },
    /// Scanner-driven notification: rows were appended to a bucket's queue.
    QueueUpdated {
        bucket_id: BucketId,
        added: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ReplicationEvent {
    pub fn status_change(
        bucket_id: BucketId,
        file_id: FileId,
        status: FileStatus,
        source_path: impl Into<String>,
    ) -> Self {
        Self::StatusChange {
            bucket_id,
            file_id,
            status,
            source_path: source_path.into(),
            timestamp: Utc::now(),
        }
    }

    /// Progress event with the percent precomputed; a zero-byte file reports
    /// 100% so observers never divide by zero.
    pub fn copy_progress(
        bucket_id: BucketId,
        file_id: FileId,
        bytes_copied: u64,
        file_size: u64,
    ) -> Self {
        let percent = if file_size == 0 {
            100.0
        } else {
            (bytes_copied as f64 / file_size as f64) * 100.0
        };
        Self::CopyProgress {
            bucket_id,
            file_id,
            bytes_copied,
            file_size,
            percent,
        }
    }

    pub fn queue_updated(bucket_id: BucketId, added: u64) -> Self {
        Self::QueueUpdated {
            bucket_id,
            added,
            timestamp: Utc::now(),
        }
    }

    /// True for the per-file progress stream, which the bus may coalesce.
    pub fn is_progress(&self) -> bool {
        matches!(self, ReplicationEvent::CopyProgress { .. })
    }
}

/// Capability injected into schedulers and the manager; the concrete
/// broadcaster owns subscriber fan-out and batching policy.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ReplicationEvent) -> Result<()>;
}

/// Publisher that drops everything. Useful in tests and for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventPublisher;

#[async_trait]
impl EventPublisher for NullEventPublisher {
    async fn publish(&self, _event: ReplicationEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_progress_is_complete() {
        let event = ReplicationEvent::copy_progress(BucketId(1), FileId(7), 0, 0);
        match event {
            ReplicationEvent::CopyProgress { percent, .. } => {
                assert_eq!(percent, 100.0)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn percent_is_proportional() {
        let event = ReplicationEvent::copy_progress(BucketId(1), FileId(7), 25, 100);
        match event {
            ReplicationEvent::CopyProgress { percent, .. } => {
                assert!((percent - 25.0).abs() < f64::EPSILON)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn serializes_with_kind_tag() {
        let event = ReplicationEvent::queue_updated(BucketId(3), 12);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"queue-updated\""), "{json}");
    }
}
