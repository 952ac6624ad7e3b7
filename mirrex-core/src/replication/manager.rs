//! Owner of every bucket's scheduler.
//!
//! Constructed over the queue store once at startup; builds (but does not
//! start) a scheduler per persisted bucket, then `restore_state` re-attaches
//! the loops that were running before the previous shutdown. All bucket
//! lifecycle commands from the control plane land here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use mirrex_model::{
    Bucket, BucketDraft, BucketId, BucketStatus, BucketUpdate, FileEntry,
    FileId, FileStatus, HashAlgorithm, NewFileEntry,
};

use crate::error::{CoreError, Result};
use crate::replication::config::ReplicationConfig;
use crate::replication::events::{EventPublisher, ReplicationEvent};
use crate::replication::ledger::StatsSnapshot;
use crate::replication::logging::CopyLogger;
use crate::replication::scheduler::BucketScheduler;
use crate::replication::store::{ConflictAction, FolderStats, QueueStore};
use crate::replication::worker::CopyWorker;

/// Service-wide limits and copy policy the manager applies to buckets.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    /// Worker cap assigned when a draft does not name one.
    pub worker_default_count: usize,
    /// Upper bound any bucket's worker cap is clamped to.
    pub worker_max_count: usize,
    pub hash_algorithm: HashAlgorithm,
    pub copy_buffer_size: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            worker_default_count: 2,
            worker_max_count: 8,
            hash_algorithm: HashAlgorithm::default(),
            copy_buffer_size: 1024 * 1024,
        }
    }
}

/// Owns the bucket-id → scheduler map and fans lifecycle commands out.
pub struct BucketManager {
    store: Arc<QueueStore>,
    events: Arc<dyn EventPublisher>,
    logger: Arc<dyn CopyLogger>,
    config: ReplicationConfig,
    limits: ServiceLimits,
    schedulers: tokio::sync::RwLock<HashMap<i64, Arc<BucketScheduler>>>,
}

impl fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheduler_count = self
            .schedulers
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("BucketManager")
            .field("scheduler_count", &scheduler_count)
            .field("limits", &self.limits)
            .finish()
    }
}

impl BucketManager {
    /// Build the manager and a (stopped) scheduler for every persisted
    /// bucket.
    pub async fn initialize(
        store: Arc<QueueStore>,
        events: Arc<dyn EventPublisher>,
        logger: Arc<dyn CopyLogger>,
        config: ReplicationConfig,
        limits: ServiceLimits,
    ) -> Result<Self> {
        let manager = Self {
            store,
            events,
            logger,
            config,
            limits,
            schedulers: tokio::sync::RwLock::new(HashMap::new()),
        };

        let buckets = manager.store.list_buckets().await?;
        for bucket in &buckets {
            manager.insert_scheduler(bucket).await;
        }
        info!(buckets = buckets.len(), "bucket manager initialized");
        Ok(manager)
    }

    fn build_worker(&self) -> CopyWorker {
        CopyWorker::new(
            self.limits.hash_algorithm,
            self.limits.copy_buffer_size,
            self.config.progress_interval(),
        )
    }

    async fn insert_scheduler(&self, bucket: &Bucket) -> Arc<BucketScheduler> {
        let scheduler = Arc::new(BucketScheduler::new(
            bucket.id,
            bucket.status,
            Arc::clone(&self.store),
            self.build_worker(),
            Arc::clone(&self.events),
            Arc::clone(&self.logger),
            self.config.clone(),
        ));
        self.schedulers
            .write()
            .await
            .insert(bucket.id.as_i64(), Arc::clone(&scheduler));
        scheduler
    }

    async fn scheduler(&self, id: BucketId) -> Result<Arc<BucketScheduler>> {
        self.schedulers
            .read()
            .await
            .get(&id.as_i64())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("bucket {id}")))
    }

    /// Re-attach scheduler loops for buckets whose persisted status was
    /// `running` (or `paused`) at the previous shutdown.
    pub async fn restore_state(&self) -> Result<()> {
        let schedulers: Vec<Arc<BucketScheduler>> =
            self.schedulers.read().await.values().cloned().collect();
        for scheduler in schedulers {
            scheduler.restore().await?;
        }
        self.logger.system("scheduler state restored");
        Ok(())
    }

    // ---- bucket CRUD ----------------------------------------------------

    pub async fn create_bucket(&self, mut draft: BucketDraft) -> Result<Bucket> {
        if draft.worker_count == 0 {
            draft.worker_count = self.limits.worker_default_count;
        }
        draft.worker_count = draft.worker_count.clamp(1, self.limits.worker_max_count);

        let bucket = self.store.create_bucket(&draft).await?;
        self.insert_scheduler(&bucket).await;

        let _ = self
            .events
            .publish(ReplicationEvent::ServiceChange {
                bucket_id: bucket.id,
                status: bucket.status,
                worker_count: bucket.worker_count,
                active_workers: 0,
            })
            .await;
        self.logger
            .system(&format!("bucket '{}' created", bucket.name));
        Ok(bucket)
    }

    /// Sources and destination may only change while the scheduler is
    /// stopped; the worker cap may change live and applies to subsequent
    /// claims.
    pub async fn update_bucket(
        &self,
        id: BucketId,
        mut update: BucketUpdate,
    ) -> Result<Bucket> {
        let scheduler = self.scheduler(id).await?;
        if update.requires_stopped() && scheduler.status() != BucketStatus::Stopped {
            return Err(CoreError::InvalidState(format!(
                "bucket {id} must be stopped to change sources or destination"
            )));
        }
        if let Some(worker_count) = update.worker_count {
            update.worker_count =
                Some(worker_count.clamp(1, self.limits.worker_max_count));
        }

        let bucket = self.store.update_bucket(id, &update).await?;
        scheduler.invalidate_cache();

        let _ = self
            .events
            .publish(ReplicationEvent::ServiceChange {
                bucket_id: bucket.id,
                status: scheduler.status(),
                worker_count: bucket.worker_count,
                active_workers: scheduler.active_workers(),
            })
            .await;
        Ok(bucket)
    }

    pub async fn delete_bucket(&self, id: BucketId) -> Result<()> {
        let scheduler = self.scheduler(id).await?;
        if scheduler.status() != BucketStatus::Stopped {
            return Err(CoreError::InvalidState(format!(
                "bucket {id} must be stopped before deletion"
            )));
        }
        self.store.delete_bucket(id).await?;
        self.schedulers.write().await.remove(&id.as_i64());
        self.logger.system(&format!("bucket {id} deleted"));
        Ok(())
    }

    pub async fn bucket(&self, id: BucketId) -> Result<Bucket> {
        self.store.bucket(id).await
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.store.list_buckets().await
    }

    // ---- lifecycle ------------------------------------------------------

    pub async fn start_bucket(&self, id: BucketId) -> Result<()> {
        self.scheduler(id).await?.start().await
    }

    pub async fn pause_bucket(&self, id: BucketId) -> Result<()> {
        self.scheduler(id).await?.pause().await
    }

    pub async fn resume_bucket(&self, id: BucketId) -> Result<()> {
        self.scheduler(id).await?.resume().await
    }

    pub async fn stop_bucket(&self, id: BucketId) -> Result<()> {
        self.scheduler(id).await?.stop().await
    }

    pub async fn bucket_status(&self, id: BucketId) -> Result<BucketStatus> {
        Ok(self.scheduler(id).await?.status())
    }

    pub async fn active_workers(&self, id: BucketId) -> Result<usize> {
        Ok(self.scheduler(id).await?.active_workers())
    }

    /// Stop every scheduler concurrently; resolves when all report stopped.
    pub async fn stop_all(&self) -> Result<()> {
        let schedulers: Vec<Arc<BucketScheduler>> =
            self.schedulers.read().await.values().cloned().collect();
        let results = join_all(schedulers.iter().map(|scheduler| async move {
            match scheduler.status() {
                BucketStatus::Stopped => Ok(()),
                _ => scheduler.stop().await,
            }
        }))
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Graceful-shutdown wrapper: `stop_all` bounded by the configured
    /// timeout, after which in-flight copies are aborted at their next chunk
    /// boundary. Rows owned by aborted workers are recovered to `pending` by
    /// the next startup's crash recovery.
    pub async fn shutdown(&self) -> Result<()> {
        match tokio::time::timeout(self.config.shutdown_timeout(), self.stop_all())
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout_secs,
                    "graceful shutdown timed out, aborting in-flight copies"
                );
                let schedulers: Vec<Arc<BucketScheduler>> =
                    self.schedulers.read().await.values().cloned().collect();
                for scheduler in &schedulers {
                    scheduler.abort_workers();
                }
                self.logger
                    .system("shutdown timeout reached, in-flight copies aborted");
                Ok(())
            }
        }
    }

    // ---- queue ingestion & operator actions -----------------------------

    /// Scanner-facing ingestion: dedup-inserting rows and notifying
    /// observers when anything was actually added.
    pub async fn enqueue_files(
        &self,
        id: BucketId,
        rows: &[NewFileEntry],
    ) -> Result<u64> {
        let added = self.store.insert_files(id, rows).await?;
        if added > 0 {
            let _ = self
                .events
                .publish(ReplicationEvent::queue_updated(id, added))
                .await;
        }
        Ok(added)
    }

    pub async fn resolve_conflict(
        &self,
        bucket_id: BucketId,
        file_id: FileId,
        action: ConflictAction,
    ) -> Result<Option<FileEntry>> {
        // Scoped lookup: a row id from another bucket resolves to nothing.
        let Some(current) = self.store.entry_in_bucket(bucket_id, file_id).await?
        else {
            return Ok(None);
        };
        if current.status != FileStatus::Conflict {
            return Ok(None);
        }
        if action == ConflictAction::Overwrite {
            // Clear the stale destination while the row is still parked in
            // conflict (not claimable), so the re-queued copy takes the
            // destination-missing path.
            crate::replication::worker::unlink_partial(
                &current.destination_path,
            )
            .await;
        }

        let resolved = self
            .store
            .resolve_conflict_in_bucket(bucket_id, file_id, action)
            .await?;
        if let Some(entry) = &resolved {
            let _ = self
                .events
                .publish(ReplicationEvent::status_change(
                    entry.bucket_id,
                    entry.id,
                    entry.status,
                    entry.source_path.to_string_lossy(),
                ))
                .await;
        }
        Ok(resolved)
    }

    pub async fn resolve_conflicts_bulk(
        &self,
        bucket_id: Option<BucketId>,
        action: ConflictAction,
    ) -> Result<u64> {
        let resolved = self.store.resolve_conflicts_bulk(bucket_id, action).await?;
        if action == ConflictAction::Overwrite {
            for entry in &resolved {
                crate::replication::worker::unlink_partial(
                    &entry.destination_path,
                )
                .await;
            }
        }
        if !resolved.is_empty() {
            self.logger.system(&format!(
                "{} conflicts resolved in bulk",
                resolved.len()
            ));
        }
        Ok(resolved.len() as u64)
    }

    pub async fn retry_error(
        &self,
        bucket_id: BucketId,
        file_id: FileId,
    ) -> Result<Option<FileEntry>> {
        let retried = self
            .store
            .retry_error_in_bucket(bucket_id, file_id)
            .await?;
        if let Some(entry) = &retried {
            let _ = self
                .events
                .publish(ReplicationEvent::status_change(
                    entry.bucket_id,
                    entry.id,
                    entry.status,
                    entry.source_path.to_string_lossy(),
                ))
                .await;
        }
        Ok(retried)
    }

    pub async fn retry_errors_bulk(
        &self,
        bucket_id: Option<BucketId>,
    ) -> Result<u64> {
        let retried = self.store.retry_errors_bulk(bucket_id).await?;
        if !retried.is_empty() {
            self.logger
                .system(&format!("{} errored rows re-queued", retried.len()));
        }
        Ok(retried.len() as u64)
    }

    // ---- stats ----------------------------------------------------------

    pub fn stats(&self, bucket_id: Option<BucketId>) -> StatsSnapshot {
        self.store.stats(bucket_id)
    }

    pub async fn folder_stats(
        &self,
        bucket_id: BucketId,
    ) -> Result<Arc<Vec<FolderStats>>> {
        self.store.folder_stats_cached(bucket_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::events::NullEventPublisher;
    use crate::replication::logging::NullCopyLogger;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> ReplicationConfig {
        ReplicationConfig {
            busy_tick_ms: 10,
            idle_tick_ms: 20,
            folder_cache_ttl_ms: 10,
            ..Default::default()
        }
    }

    async fn open_manager(dir: &TempDir) -> (Arc<QueueStore>, BucketManager) {
        let config = fast_config();
        let store = Arc::new(
            QueueStore::open(&dir.path().join("queue.db"), &config)
                .await
                .unwrap(),
        );
        let manager = BucketManager::initialize(
            Arc::clone(&store),
            Arc::new(NullEventPublisher),
            Arc::new(NullCopyLogger),
            config,
            ServiceLimits::default(),
        )
        .await
        .unwrap();
        (store, manager)
    }

    fn draft(dir: &TempDir, name: &str) -> BucketDraft {
        let source = dir.path().join(format!("{name}-src"));
        std::fs::create_dir_all(&source).unwrap();
        BucketDraft {
            name: name.into(),
            source_folders: vec![source],
            destination_folder: dir.path().join(format!("{name}-dst")),
            worker_count: 2,
        }
    }

    fn seed_file(
        bucket: &Bucket,
        name: &str,
        contents: &[u8],
    ) -> NewFileEntry {
        let source_root = &bucket.source_folders[0];
        let path = source_root.join(name);
        std::fs::write(&path, contents).unwrap();
        NewFileEntry::mirrored(
            source_root,
            &path,
            &bucket.destination_folder,
            contents.len() as u64,
        )
        .unwrap()
    }

    async fn wait_until<F>(mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if check().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn worker_cap_is_clamped_on_create_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = open_manager(&dir).await;

        let mut big = draft(&dir, "big");
        big.worker_count = 100;
        let bucket = manager.create_bucket(big).await.unwrap();
        assert_eq!(bucket.worker_count, ServiceLimits::default().worker_max_count);

        let updated = manager
            .update_bucket(
                bucket.id,
                BucketUpdate {
                    worker_count: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            updated.worker_count,
            ServiceLimits::default().worker_max_count
        );
    }

    #[tokio::test]
    async fn source_changes_require_stopped_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = open_manager(&dir).await;
        let bucket = manager.create_bucket(draft(&dir, "guarded")).await.unwrap();

        manager.start_bucket(bucket.id).await.unwrap();
        let result = manager
            .update_bucket(
                bucket.id,
                BucketUpdate {
                    source_folders: Some(vec![PathBuf::from("/elsewhere")]),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));

        // Worker cap changes are allowed live.
        manager
            .update_bucket(
                bucket.id,
                BucketUpdate {
                    worker_count: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        manager.stop_bucket(bucket.id).await.unwrap();
        manager
            .update_bucket(
                bucket.id,
                BucketUpdate {
                    source_folders: Some(vec![dir.path().join("guarded-src")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_requires_stopped_and_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = open_manager(&dir).await;
        let bucket = manager.create_bucket(draft(&dir, "doomed")).await.unwrap();
        let rows = vec![seed_file(&bucket, "f.bin", b"bytes")];
        manager.enqueue_files(bucket.id, &rows).await.unwrap();

        manager.start_bucket(bucket.id).await.unwrap();
        assert!(matches!(
            manager.delete_bucket(bucket.id).await,
            Err(CoreError::InvalidState(_))
        ));

        manager.stop_bucket(bucket.id).await.unwrap();
        manager.delete_bucket(bucket.id).await.unwrap();
        assert!(matches!(
            manager.bucket(bucket.id).await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(store.stats(None).breakdown.total_count(), 0);
        assert!(matches!(
            manager.start_bucket(bucket.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn end_to_end_copy_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = open_manager(&dir).await;
        let bucket = manager.create_bucket(draft(&dir, "flow")).await.unwrap();
        let rows = vec![
            seed_file(&bucket, "one.txt", b"first"),
            seed_file(&bucket, "two.txt", b"second"),
        ];
        assert_eq!(manager.enqueue_files(bucket.id, &rows).await.unwrap(), 2);

        manager.start_bucket(bucket.id).await.unwrap();
        let bucket_id = bucket.id;
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.completed.count == 2
        })
        .await;
        manager.stop_all().await.unwrap();

        assert_eq!(
            std::fs::read(bucket.destination_folder.join("one.txt")).unwrap(),
            b"first"
        );
        assert_eq!(manager.bucket_status(bucket.id).await.unwrap(), BucketStatus::Stopped);
    }

    #[tokio::test]
    async fn restore_state_restarts_running_buckets() {
        let dir = tempfile::tempdir().unwrap();

        let bucket_id = {
            let (store, manager) = open_manager(&dir).await;
            let bucket = manager.create_bucket(draft(&dir, "resume")).await.unwrap();
            manager.start_bucket(bucket.id).await.unwrap();
            manager.stop_all().await.unwrap();
            // Doctor the row to look like an unclean shutdown left the
            // bucket running.
            store
                .set_bucket_status(bucket.id, BucketStatus::Running)
                .await
                .unwrap();
            store.close().await;
            bucket.id
        };

        let (store, manager) = open_manager(&dir).await;
        assert_eq!(
            manager.bucket_status(bucket_id).await.unwrap(),
            BucketStatus::Running,
            "persisted status survives the restart"
        );
        manager.restore_state().await.unwrap();

        // A freshly enqueued row is picked up by the restored loop.
        let bucket = manager.bucket(bucket_id).await.unwrap();
        std::fs::create_dir_all(&bucket.source_folders[0]).unwrap();
        let rows = vec![seed_file(&bucket, "after-restart.txt", b"back")];
        manager.enqueue_files(bucket_id, &rows).await.unwrap();
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.completed.count
                == store.stats(Some(bucket_id)).breakdown.total_count()
        })
        .await;
        manager.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn conflict_resolution_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = open_manager(&dir).await;
        let bucket = manager.create_bucket(draft(&dir, "conflicts")).await.unwrap();

        // Two divergent destinations: one to skip, one to overwrite.
        let rows = vec![
            seed_file(&bucket, "keep.txt", b"fresh keep"),
            seed_file(&bucket, "replace.txt", b"fresh replace"),
        ];
        std::fs::create_dir_all(&bucket.destination_folder).unwrap();
        std::fs::write(bucket.destination_folder.join("keep.txt"), b"stale keep")
            .unwrap();
        std::fs::write(
            bucket.destination_folder.join("replace.txt"),
            b"stale replace",
        )
        .unwrap();
        manager.enqueue_files(bucket.id, &rows).await.unwrap();

        manager.start_bucket(bucket.id).await.unwrap();
        let bucket_id = bucket.id;
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.conflict.count == 2
        })
        .await;

        let conflicted = store
            .entries_by_status(Some(bucket.id), FileStatus::Conflict, 10, 0)
            .await
            .unwrap();
        let keep = conflicted
            .iter()
            .find(|e| e.relative_path == Path::new("keep.txt"))
            .unwrap();
        let replace = conflicted
            .iter()
            .find(|e| e.relative_path == Path::new("replace.txt"))
            .unwrap();

        // skip: completed without touching the destination.
        let skipped = manager
            .resolve_conflict(bucket.id, keep.id, ConflictAction::Skip)
            .await
            .unwrap()
            .expect("row was in conflict");
        assert_eq!(skipped.status, FileStatus::Completed);
        assert_eq!(
            std::fs::read(bucket.destination_folder.join("keep.txt")).unwrap(),
            b"stale keep",
            "skip must leave the destination untouched"
        );

        // overwrite: re-queued, then the running scheduler replaces the
        // destination with the source bytes.
        let resolved = manager
            .resolve_conflict(bucket.id, replace.id, ConflictAction::Overwrite)
            .await
            .unwrap()
            .expect("row was in conflict");
        assert_eq!(resolved.status, FileStatus::Pending);
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.completed.count == 2
        })
        .await;
        assert_eq!(
            std::fs::read(bucket.destination_folder.join("replace.txt")).unwrap(),
            b"fresh replace"
        );

        manager.stop_all().await.unwrap();
    }
}
