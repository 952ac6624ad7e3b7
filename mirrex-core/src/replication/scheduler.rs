//! Per-bucket claim-and-dispatch loop.
//!
//! One scheduler owns one bucket: a single cooperative task that selects the
//! next source folder (draining folders in source-list order), claims a batch
//! of pending rows, and spawns one copy task per claimed row, bounded by the
//! bucket's worker cap. Workers never touch durable state; their outcomes are
//! routed back through the store here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use mirrex_model::{BucketId, BucketStatus, FileEntry, FileStatus};

use crate::error::{CoreError, Result};
use crate::replication::config::ReplicationConfig;
use crate::replication::events::{EventPublisher, ReplicationEvent};
use crate::replication::logging::{CopyLogRecord, CopyLogger};
use crate::replication::store::{
    EntryCommit, FolderActivity, QueueStore,
};
use crate::replication::worker::{
    CopyOutcome, CopyRequest, CopyWorker, INTEGRITY_ERROR_MESSAGE,
};

/// Commit arguments for each worker outcome. `identical` commits as
/// `completed`; an integrity failure commits as `error` with the fixed
/// integrity message.
pub(crate) fn commit_for_outcome(outcome: &CopyOutcome) -> EntryCommit {
    match outcome {
        CopyOutcome::Completed { hash, .. } | CopyOutcome::Identical { hash } => {
            EntryCommit {
                status: FileStatus::Completed,
                source_hash: Some(hash.clone()),
                destination_hash: Some(hash.clone()),
                error_message: None,
            }
        }
        CopyOutcome::Conflict {
            source_hash,
            destination_hash,
        } => EntryCommit {
            status: FileStatus::Conflict,
            source_hash: Some(source_hash.clone()),
            destination_hash: Some(destination_hash.clone()),
            error_message: None,
        },
        CopyOutcome::IntegrityError {
            source_hash,
            destination_hash,
        } => EntryCommit {
            status: FileStatus::Error,
            source_hash: Some(source_hash.clone()),
            destination_hash: Some(destination_hash.clone()),
            error_message: Some(INTEGRITY_ERROR_MESSAGE.to_string()),
        },
        CopyOutcome::Error { message } => EntryCommit {
            status: FileStatus::Error,
            source_hash: None,
            destination_hash: None,
            error_message: Some(message.clone()),
        },
    }
}

fn outcome_label(outcome: &CopyOutcome) -> &'static str {
    match outcome {
        CopyOutcome::Completed { .. } => "completed",
        CopyOutcome::Identical { .. } => "identical",
        CopyOutcome::Conflict { .. } => "conflict",
        CopyOutcome::IntegrityError { .. } => "integrity_error",
        CopyOutcome::Error { .. } => "error",
    }
}

/// Cached bucket shape consulted every tick; rebuilt when the manager bumps
/// the generation after a bucket mutation.
#[derive(Debug, Clone)]
struct BucketView {
    generation: u64,
    name: String,
    source_folders: Vec<String>,
    worker_cap: usize,
}

struct SchedulerInner {
    bucket_id: BucketId,
    store: Arc<QueueStore>,
    worker: CopyWorker,
    events: Arc<dyn EventPublisher>,
    logger: Arc<dyn CopyLogger>,
    config: ReplicationConfig,
    status: Mutex<BucketStatus>,
    active_workers: AtomicUsize,
    quiesced: Notify,
    next_worker_id: AtomicI64,
    generation: AtomicU64,
    view: Mutex<Option<BucketView>>,
    folder_counts: Mutex<Option<(Instant, BTreeMap<String, FolderActivity>)>>,
    loop_cancel: Mutex<Option<CancellationToken>>,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Hard-abort for in-flight copies; only the shutdown wrapper fires it.
    copy_cancel: CancellationToken,
}

impl fmt::Debug for SchedulerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerInner")
            .field("bucket_id", &self.bucket_id)
            .field("status", &*self.status.lock())
            .field(
                "active_workers",
                &self.active_workers.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Per-bucket scheduler; cheap to clone handles are not needed, the manager
/// holds it in an `Arc`.
pub struct BucketScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for BucketScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketScheduler")
            .field("inner", &self.inner)
            .finish()
    }
}

impl BucketScheduler {
    pub fn new(
        bucket_id: BucketId,
        initial_status: BucketStatus,
        store: Arc<QueueStore>,
        worker: CopyWorker,
        events: Arc<dyn EventPublisher>,
        logger: Arc<dyn CopyLogger>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                bucket_id,
                store,
                worker,
                events,
                logger,
                config,
                status: Mutex::new(initial_status),
                active_workers: AtomicUsize::new(0),
                quiesced: Notify::new(),
                next_worker_id: AtomicI64::new(0),
                generation: AtomicU64::new(0),
                view: Mutex::new(None),
                folder_counts: Mutex::new(None),
                loop_cancel: Mutex::new(None),
                loop_handle: tokio::sync::Mutex::new(None),
                copy_cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn bucket_id(&self) -> BucketId {
        self.inner.bucket_id
    }

    pub fn status(&self) -> BucketStatus {
        *self.inner.status.lock()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    /// Drop cached bucket shape so the next tick re-reads it. Called by the
    /// manager after any bucket mutation.
    pub fn invalidate_cache(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        *self.inner.folder_counts.lock() = None;
    }

    /// Cancel in-flight copies at their next chunk boundary. Only the
    /// hard-shutdown path uses this; a regular `stop` lets workers finish.
    pub fn abort_workers(&self) {
        self.inner.copy_cancel.cancel();
    }

    /// stopped → running.
    pub async fn start(&self) -> Result<()> {
        self.transition(BucketStatus::Running, &[BucketStatus::Stopped])
            .await?;
        self.ensure_loop().await;
        self.emit_service_change().await;
        info!(bucket = %self.inner.bucket_id, "scheduler started");
        Ok(())
    }

    /// running → paused. Claiming stops; dispatched workers run to completion.
    pub async fn pause(&self) -> Result<()> {
        self.transition(BucketStatus::Paused, &[BucketStatus::Running])
            .await?;
        self.emit_service_change().await;
        info!(bucket = %self.inner.bucket_id, "scheduler paused");
        Ok(())
    }

    /// paused → running.
    pub async fn resume(&self) -> Result<()> {
        self.transition(BucketStatus::Running, &[BucketStatus::Paused])
            .await?;
        self.ensure_loop().await;
        self.emit_service_change().await;
        info!(bucket = %self.inner.bucket_id, "scheduler resumed");
        Ok(())
    }

    /// {running, paused} → stopped. Resolves once the claim loop has exited
    /// and the active worker count has reached zero.
    pub async fn stop(&self) -> Result<()> {
        self.transition(
            BucketStatus::Stopped,
            &[BucketStatus::Running, BucketStatus::Paused],
        )
        .await?;

        if let Some(cancel) = self.inner.loop_cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.wait_for_quiescence().await;
        self.emit_service_change().await;
        info!(bucket = %self.inner.bucket_id, "scheduler stopped");
        Ok(())
    }

    /// Re-attach after a restart: the persisted status is already in the
    /// bucket row, so only the loop needs restarting.
    pub async fn restore(&self) -> Result<()> {
        match self.status() {
            BucketStatus::Stopped => Ok(()),
            BucketStatus::Running | BucketStatus::Paused => {
                self.ensure_loop().await;
                self.emit_service_change().await;
                Ok(())
            }
        }
    }

    async fn transition(
        &self,
        to: BucketStatus,
        allowed_from: &[BucketStatus],
    ) -> Result<()> {
        let prior = {
            let mut status = self.inner.status.lock();
            let prior = *status;
            if !allowed_from.contains(&prior) {
                return Err(CoreError::InvalidState(format!(
                    "bucket {} is {prior}, cannot move to {to}",
                    self.inner.bucket_id
                )));
            }
            *status = to;
            prior
        };

        if let Err(err) = self
            .inner
            .store
            .set_bucket_status(self.inner.bucket_id, to)
            .await
        {
            // Durable state is authoritative; revert the in-memory flip.
            *self.inner.status.lock() = prior;
            return Err(err);
        }
        Ok(())
    }

    async fn ensure_loop(&self) {
        let mut handle = self.inner.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *self.inner.loop_cancel.lock() = Some(cancel.clone());
        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(run_loop(inner, cancel)));
    }

    async fn wait_for_quiescence(&self) {
        loop {
            if self.inner.active_workers.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.inner.quiesced.notified();
            if self.inner.active_workers.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn emit_service_change(&self) {
        let worker_count = self
            .inner
            .bucket_view()
            .await
            .map(|view| view.worker_cap)
            .unwrap_or(0);
        let _ = self
            .inner
            .events
            .publish(ReplicationEvent::ServiceChange {
                bucket_id: self.inner.bucket_id,
                status: self.status(),
                worker_count,
                active_workers: self.active_workers(),
            })
            .await;
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, cancel: CancellationToken) {
    let mut tick = inner.config.busy_tick();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        if *inner.status.lock() != BucketStatus::Running {
            tick = inner.config.idle_tick();
            continue;
        }

        match SchedulerInner::tick(&inner).await {
            Ok(claimed) => {
                let busy = claimed > 0
                    || inner.active_workers.load(Ordering::Acquire) > 0;
                tick = if busy {
                    inner.config.busy_tick()
                } else {
                    inner.config.idle_tick()
                };
            }
            Err(err) => {
                error!(
                    bucket = %inner.bucket_id,
                    error = %err,
                    "scheduler tick failed"
                );
                tick = inner.config.idle_tick();
            }
        }
    }
    debug!(bucket = %inner.bucket_id, "scheduler loop exited");
}

impl SchedulerInner {
    async fn bucket_view(&self) -> Result<BucketView> {
        let generation = self.generation.load(Ordering::Acquire);
        {
            let guard = self.view.lock();
            if let Some(view) = guard.as_ref()
                && view.generation == generation
            {
                return Ok(view.clone());
            }
        }

        let bucket = self.store.bucket(self.bucket_id).await?;
        let view = BucketView {
            generation,
            name: bucket.name,
            source_folders: bucket
                .source_folders
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            worker_cap: bucket.worker_count,
        };
        *self.view.lock() = Some(view.clone());
        Ok(view)
    }

    async fn folder_activity(
        &self,
    ) -> Result<BTreeMap<String, FolderActivity>> {
        {
            let guard = self.folder_counts.lock();
            if let Some((at, counts)) = guard.as_ref()
                && at.elapsed() < self.config.folder_cache_ttl()
            {
                return Ok(counts.clone());
            }
        }
        let counts = self.store.folder_active_counts(self.bucket_id).await?;
        *self.folder_counts.lock() = Some((Instant::now(), counts.clone()));
        Ok(counts)
    }

    /// One claim-and-dispatch pass. Returns how many rows were claimed.
    async fn tick(this: &Arc<Self>) -> Result<usize> {
        let view = this.bucket_view().await?;
        if view.source_folders.is_empty() {
            return Ok(0);
        }

        let counts = this.folder_activity().await?;
        // Folder stickiness: take the first folder (in source-list order)
        // that still has pending or in-flight rows, so folders drain
        // sequentially.
        let Some(folder) = view.source_folders.iter().find(|folder| {
            counts
                .get(folder.as_str())
                .is_some_and(FolderActivity::is_active)
        }) else {
            return Ok(0);
        };
        let activity = counts.get(folder.as_str()).copied().unwrap_or_default();
        if activity.pending == 0 {
            // Current folder still has in-flight rows; wait for it to drain
            // before moving on.
            return Ok(0);
        }

        let active = this.active_workers.load(Ordering::Acquire);
        if active >= view.worker_cap {
            return Ok(0);
        }
        let slots =
            (view.worker_cap - active).min(this.config.claim_batch_limit);

        let worker_id = this.next_worker_id.fetch_add(1, Ordering::AcqRel) + 1;
        let claimed = this
            .store
            .claim_pending(
                this.bucket_id,
                Some(Path::new(folder)),
                slots,
                worker_id,
            )
            .await?;
        *this.folder_counts.lock() = None;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(
            bucket = %this.bucket_id,
            folder,
            claimed = claimed.len(),
            worker_id,
            "claimed batch"
        );

        for entry in &claimed {
            let _ = this
                .events
                .publish(ReplicationEvent::status_change(
                    entry.bucket_id,
                    entry.id,
                    FileStatus::InProgress,
                    entry.source_path.to_string_lossy(),
                ))
                .await;
        }

        let count = claimed.len();
        for entry in claimed {
            Self::dispatch(this, entry, view.name.clone(), worker_id);
        }
        Ok(count)
    }

    fn dispatch(
        this: &Arc<Self>,
        entry: FileEntry,
        bucket_name: String,
        worker_id: i64,
    ) {
        this.active_workers.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let request = CopyRequest {
                file_id: entry.id,
                bucket_id: entry.bucket_id,
                source_path: entry.source_path.clone(),
                destination_path: entry.destination_path.clone(),
                file_size: entry.file_size,
            };

            let progress_events = Arc::clone(&inner.events);
            let bucket_id = entry.bucket_id;
            let file_id = entry.id;
            let progress = move |report: crate::replication::worker::CopyProgress| {
                let events = Arc::clone(&progress_events);
                let event = ReplicationEvent::copy_progress(
                    bucket_id,
                    file_id,
                    report.bytes_copied,
                    report.file_size,
                );
                tokio::spawn(async move {
                    let _ = events.publish(event).await;
                });
            };

            let outcome = inner
                .worker
                .run(&request, progress, &inner.copy_cancel)
                .await;
            inner.finish(entry, outcome, bucket_name, worker_id).await;

            if inner.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.quiesced.notify_waiters();
            }
        });
    }

    async fn finish(
        &self,
        entry: FileEntry,
        outcome: CopyOutcome,
        bucket_name: String,
        worker_id: i64,
    ) {
        let label = outcome_label(&outcome);
        let commit = commit_for_outcome(&outcome);
        match self.store.commit_outcome(entry.id, commit).await {
            Ok(updated) => {
                let _ = self
                    .events
                    .publish(ReplicationEvent::status_change(
                        updated.bucket_id,
                        updated.id,
                        updated.status,
                        updated.source_path.to_string_lossy(),
                    ))
                    .await;
                self.logger.log(
                    label,
                    CopyLogRecord {
                        bucket_name,
                        source_path: entry.source_path.to_string_lossy().into_owned(),
                        source_folder: entry
                            .source_folder
                            .to_string_lossy()
                            .into_owned(),
                        file_size: entry.file_size,
                        source_hash: updated.source_hash.clone(),
                        worker_id,
                        message: updated.error_message.clone(),
                    },
                );
            }
            Err(err) => {
                error!(
                    bucket = %self.bucket_id,
                    file = %entry.source_path.display(),
                    error = %err,
                    "failed to commit worker outcome"
                );
                self.logger.system(&format!(
                    "failed to commit outcome for {}: {err}",
                    entry.source_path.display()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::events::NullEventPublisher;
    use crate::replication::logging::NullCopyLogger;
    use mirrex_model::{BucketDraft, HashAlgorithm, NewFileEntry};
    use std::path::PathBuf;
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

    struct Harness {
        _dir: TempDir,
        store: Arc<QueueStore>,
        scheduler: BucketScheduler,
        bucket: mirrex_model::Bucket,
        source_root: PathBuf,
        destination_root: PathBuf,
    }

    async fn harness(worker_count: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let source_root = dir.path().join("src");
        let destination_root = dir.path().join("dst");
        std::fs::create_dir_all(&source_root).unwrap();

        let config = fast_config();
        let store = Arc::new(
            QueueStore::open(&dir.path().join("queue.db"), &config)
                .await
                .unwrap(),
        );
        let bucket = store
            .create_bucket(&BucketDraft {
                name: "test".into(),
                source_folders: vec![source_root.clone()],
                destination_folder: destination_root.clone(),
                worker_count,
            })
            .await
            .unwrap();

        let scheduler = BucketScheduler::new(
            bucket.id,
            bucket.status,
            Arc::clone(&store),
            CopyWorker::new(HashAlgorithm::Xxhash3, 8192, Duration::from_millis(0)),
            Arc::new(NullEventPublisher),
            Arc::new(NullCopyLogger),
            config,
        );

        Harness {
            _dir: dir,
            store,
            scheduler,
            bucket,
            source_root,
            destination_root,
        }
    }

    fn seed_file(harness: &Harness, name: &str, contents: &[u8]) -> NewFileEntry {
        let path = harness.source_root.join(name);
        std::fs::write(&path, contents).unwrap();
        NewFileEntry::mirrored(
            &harness.source_root,
            &path,
            &harness.destination_root,
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

    #[test]
    fn outcome_commit_mapping() {
        let completed = commit_for_outcome(&CopyOutcome::Completed {
            hash: "h".into(),
            bytes_copied: 1,
        });
        assert_eq!(completed.status, FileStatus::Completed);
        assert_eq!(completed.source_hash, completed.destination_hash);

        let identical = commit_for_outcome(&CopyOutcome::Identical { hash: "h".into() });
        assert_eq!(identical.status, FileStatus::Completed);

        let conflict = commit_for_outcome(&CopyOutcome::Conflict {
            source_hash: "s".into(),
            destination_hash: "d".into(),
        });
        assert_eq!(conflict.status, FileStatus::Conflict);
        assert_ne!(conflict.source_hash, conflict.destination_hash);

        let integrity = commit_for_outcome(&CopyOutcome::IntegrityError {
            source_hash: "s".into(),
            destination_hash: "d".into(),
        });
        assert_eq!(integrity.status, FileStatus::Error);
        assert_eq!(
            integrity.error_message.as_deref(),
            Some(INTEGRITY_ERROR_MESSAGE)
        );

        let failed = commit_for_outcome(&CopyOutcome::Error {
            message: "disk on fire".into(),
        });
        assert_eq!(failed.status, FileStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn drains_queue_and_copies_files() {
        let h = harness(2).await;
        let rows = vec![
            seed_file(&h, "a.txt", b"alpha"),
            seed_file(&h, "b.txt", b"bravo"),
            seed_file(&h, "c.txt", b"charlie"),
        ];
        h.store.insert_files(h.bucket.id, &rows).await.unwrap();

        h.scheduler.start().await.unwrap();
        let store = Arc::clone(&h.store);
        let bucket_id = h.bucket.id;
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.completed.count == 3
        })
        .await;
        h.scheduler.stop().await.unwrap();

        assert_eq!(
            std::fs::read(h.destination_root.join("a.txt")).unwrap(),
            b"alpha"
        );
        let entries = h
            .store
            .entries_by_status(Some(bucket_id), FileStatus::Completed, 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.source_hash.is_some()
            && e.source_hash == e.destination_hash));
    }

    #[tokio::test]
    async fn pause_stops_claiming_and_resume_drains() {
        let h = harness(1).await;
        h.scheduler.start().await.unwrap();
        h.scheduler.pause().await.unwrap();
        assert_eq!(h.scheduler.status(), BucketStatus::Paused);

        let rows = vec![seed_file(&h, "late.txt", b"late")];
        h.store.insert_files(h.bucket.id, &rows).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            h.store.stats(Some(h.bucket.id)).breakdown.pending.count,
            1,
            "paused scheduler must not claim"
        );

        h.scheduler.resume().await.unwrap();
        let store = Arc::clone(&h.store);
        let bucket_id = h.bucket.id;
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.completed.count == 1
        })
        .await;
        h.scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_waits_for_workers_and_blocks_invalid_transitions() {
        let h = harness(1).await;

        // Invalid transitions from stopped.
        assert!(matches!(
            h.scheduler.pause().await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            h.scheduler.resume().await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            h.scheduler.stop().await,
            Err(CoreError::InvalidState(_))
        ));

        h.scheduler.start().await.unwrap();
        assert!(matches!(
            h.scheduler.start().await,
            Err(CoreError::InvalidState(_))
        ));

        let rows = vec![seed_file(&h, "one.txt", b"payload")];
        h.store.insert_files(h.bucket.id, &rows).await.unwrap();

        h.scheduler.stop().await.unwrap();
        assert_eq!(h.scheduler.status(), BucketStatus::Stopped);
        assert_eq!(h.scheduler.active_workers(), 0);

        // Persisted status followed the transition.
        let persisted = h.store.bucket(h.bucket.id).await.unwrap();
        assert_eq!(persisted.status, BucketStatus::Stopped);
    }

    #[tokio::test]
    async fn conflicting_destination_parks_row_for_operator() {
        let h = harness(1).await;
        let rows = vec![seed_file(&h, "clash.txt", b"fresh contents")];
        std::fs::create_dir_all(&h.destination_root).unwrap();
        std::fs::write(h.destination_root.join("clash.txt"), b"stale contents")
            .unwrap();
        h.store.insert_files(h.bucket.id, &rows).await.unwrap();

        h.scheduler.start().await.unwrap();
        let store = Arc::clone(&h.store);
        let bucket_id = h.bucket.id;
        wait_until(async || {
            store.stats(Some(bucket_id)).breakdown.conflict.count == 1
        })
        .await;
        h.scheduler.stop().await.unwrap();

        // Destination untouched; both hashes recorded and differing.
        assert_eq!(
            std::fs::read(h.destination_root.join("clash.txt")).unwrap(),
            b"stale contents"
        );
        let conflicted = h
            .store
            .entries_by_status(Some(bucket_id), FileStatus::Conflict, 10, 0)
            .await
            .unwrap();
        assert_eq!(conflicted.len(), 1);
        assert_ne!(conflicted[0].source_hash, conflicted[0].destination_hash);
        assert!(conflicted[0].source_hash.is_some());
        assert!(conflicted[0].destination_hash.is_some());
    }

    #[tokio::test]
    async fn worker_cap_bounds_active_workers() {
        let h = harness(2).await;
        let rows: Vec<NewFileEntry> = (0..6)
            .map(|i| seed_file(&h, &format!("f{i}.bin"), &vec![i as u8; 4096]))
            .collect();
        h.store.insert_files(h.bucket.id, &rows).await.unwrap();

        h.scheduler.start().await.unwrap();
        let store = Arc::clone(&h.store);
        let bucket_id = h.bucket.id;
        let mut max_seen = 0usize;
        wait_until(async || {
            max_seen = max_seen.max(h.scheduler.active_workers());
            store.stats(Some(bucket_id)).breakdown.completed.count == 6
        })
        .await;
        h.scheduler.stop().await.unwrap();
        assert!(max_seen <= 2, "active workers exceeded cap: {max_seen}");
    }
}
