use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirrex_model::{BucketId, FileId, HashAlgorithm};

use crate::hash::HashAlgorithmExt;

/// Fixed marker stored in the error message when post-copy verification
/// disagrees with the source digest.
pub const INTEGRITY_ERROR_MESSAGE: &str = "integrity verification failed";

/// Message recorded when a copy is cancelled at a chunk boundary.
pub const CANCELLED_MESSAGE: &str = "copy cancelled";

/// One claimed queue entry, reduced to what the copy needs.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub file_id: FileId,
    pub bucket_id: BucketId,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Size observed at scan time; progress percentages are computed against
    /// this, not against whatever the file has grown to.
    pub file_size: u64,
}

/// Monotonically non-decreasing byte counter reported during a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    pub bytes_copied: u64,
    pub file_size: u64,
}

/// Terminal result of one copy attempt. Exactly one is returned per run; the
/// worker never touches durable state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Fresh copy written and verified.
    Completed { hash: String, bytes_copied: u64 },
    /// Destination already existed with identical content; nothing written.
    Identical { hash: String },
    /// Destination already existed with different content; nothing modified.
    Conflict {
        source_hash: String,
        destination_hash: String,
    },
    /// The written destination failed verification and was unlinked.
    IntegrityError {
        source_hash: String,
        destination_hash: String,
    },
    /// I/O failure or cancellation; any partial destination was unlinked.
    Error { message: String },
}

/// Streamed copy-and-verify executor. Holds only policy (algorithm, chunk
/// size, progress cadence); one instance serves every worker task.
#[derive(Debug, Clone)]
pub struct CopyWorker {
    algorithm: HashAlgorithm,
    buffer_size: usize,
    progress_interval: Duration,
}

impl CopyWorker {
    pub fn new(
        algorithm: HashAlgorithm,
        buffer_size: usize,
        progress_interval: Duration,
    ) -> Self {
        Self {
            algorithm,
            buffer_size: buffer_size.max(1),
            progress_interval,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Execute one copy. I/O failures surface as [`CopyOutcome::Error`] with
    /// the OS message captured verbatim.
    pub async fn run(
        &self,
        request: &CopyRequest,
        progress: impl Fn(CopyProgress) + Send + Sync,
        cancel: &CancellationToken,
    ) -> CopyOutcome {
        match self.execute(request, &progress, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => CopyOutcome::Error {
                message: err.to_string(),
            },
        }
    }

    async fn execute(
        &self,
        request: &CopyRequest,
        progress: &(impl Fn(CopyProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> std::io::Result<CopyOutcome> {
        if let Some(parent) = request.destination_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&request.destination_path).await? {
            // Pre-existing destination: compare content, never modify it.
            let (source_hash, destination_hash) = tokio::join!(
                self.hash_file(&request.source_path, cancel),
                self.hash_file(&request.destination_path, cancel),
            );
            let source_hash = source_hash?;
            let destination_hash = destination_hash?;
            if source_hash == destination_hash {
                debug!(
                    source = %request.source_path.display(),
                    "destination already identical, skipping copy"
                );
                return Ok(CopyOutcome::Identical { hash: source_hash });
            }
            return Ok(CopyOutcome::Conflict {
                source_hash,
                destination_hash,
            });
        }

        self.copy_and_verify(request, progress, cancel).await
    }

    async fn copy_and_verify(
        &self,
        request: &CopyRequest,
        progress: &(impl Fn(CopyProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> std::io::Result<CopyOutcome> {
        let mut source = File::open(&request.source_path).await?;
        let mut destination = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&request.destination_path)
            .await?;

        let mut hasher = self.algorithm.new_hasher();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut bytes_copied = 0u64;
        let mut last_emit = Instant::now();

        loop {
            if cancel.is_cancelled() {
                drop(destination);
                unlink_partial(&request.destination_path).await;
                return Ok(CopyOutcome::Error {
                    message: CANCELLED_MESSAGE.to_string(),
                });
            }

            let read = match source.read(&mut buffer).await {
                Ok(read) => read,
                Err(err) => {
                    drop(destination);
                    unlink_partial(&request.destination_path).await;
                    return Err(err);
                }
            };
            if read == 0 {
                break;
            }

            hasher.update(&buffer[..read]);
            if let Err(err) = destination.write_all(&buffer[..read]).await {
                drop(destination);
                unlink_partial(&request.destination_path).await;
                return Err(err);
            }
            bytes_copied += read as u64;

            if last_emit.elapsed() >= self.progress_interval {
                progress(CopyProgress {
                    bytes_copied,
                    file_size: request.file_size,
                });
                last_emit = Instant::now();
            }
        }

        if let Err(err) = destination.flush().await {
            drop(destination);
            unlink_partial(&request.destination_path).await;
            return Err(err);
        }
        drop(destination);

        progress(CopyProgress {
            bytes_copied,
            file_size: request.file_size,
        });

        let source_hash = hasher.finalize_hex();
        let destination_hash =
            match self.hash_file(&request.destination_path, cancel).await {
                Ok(hash) => hash,
                Err(err) => {
                    // Unverifiable copies are not kept.
                    unlink_partial(&request.destination_path).await;
                    return Err(err);
                }
            };

        if destination_hash == source_hash {
            Ok(CopyOutcome::Completed {
                hash: source_hash,
                bytes_copied,
            })
        } else {
            warn!(
                destination = %request.destination_path.display(),
                "post-copy verification mismatch, unlinking destination"
            );
            unlink_partial(&request.destination_path).await;
            Ok(CopyOutcome::IntegrityError {
                source_hash,
                destination_hash,
            })
        }
    }

    async fn hash_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<String> {
        let mut file = File::open(path).await?;
        let mut hasher = self.algorithm.new_hasher();
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            if cancel.is_cancelled() {
                return Err(std::io::Error::new(
                    ErrorKind::Interrupted,
                    CANCELLED_MESSAGE,
                ));
            }
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hasher.finalize_hex())
    }
}

/// Best-effort unlink shared by the copy error paths and the manager's
/// overwrite resolution.
pub(crate) async fn unlink_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(
            path = %path.display(),
            error = %err,
            "failed to remove partial destination"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn worker() -> CopyWorker {
        CopyWorker::new(HashAlgorithm::Xxhash3, 4096, Duration::from_millis(0))
    }

    fn request(source: &Path, destination: &Path, size: u64) -> CopyRequest {
        CopyRequest {
            file_id: FileId(1),
            bucket_id: BucketId(1),
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            file_size: size,
        }
    }

    #[tokio::test]
    async fn fresh_copy_completes_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        let destination = dir.path().join("out/deep/a.txt");
        std::fs::write(&source, b"hello, world.").unwrap();

        let outcome = worker()
            .run(
                &request(&source, &destination, 13),
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            CopyOutcome::Completed { bytes_copied, .. } => {
                assert_eq!(bytes_copied, 13)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello, world.");
    }

    #[tokio::test]
    async fn identical_destination_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        let destination = dir.path().join("a-copy.txt");
        std::fs::write(&source, b"same bytes").unwrap();
        std::fs::write(&destination, b"same bytes").unwrap();

        let outcome = worker()
            .run(
                &request(&source, &destination, 10),
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            CopyOutcome::Identical { hash } => assert!(!hash.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn divergent_destination_reports_conflict_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        let destination = dir.path().join("a-copy.txt");
        std::fs::write(&source, b"new contents").unwrap();
        std::fs::write(&destination, b"old contents").unwrap();

        let outcome = worker()
            .run(
                &request(&source, &destination, 12),
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            CopyOutcome::Conflict {
                source_hash,
                destination_hash,
            } => assert_ne!(source_hash, destination_hash),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(std::fs::read(&destination).unwrap(), b"old contents");
    }

    #[tokio::test]
    async fn missing_source_surfaces_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("does-not-exist.txt");
        let destination = dir.path().join("out.txt");

        let outcome = worker()
            .run(
                &request(&source, &destination, 1),
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            CopyOutcome::Error { message } => {
                assert!(!message.is_empty(), "OS message expected")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn cancellation_unlinks_partial_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        let destination = dir.path().join("big-copy.bin");
        std::fs::write(&source, vec![7u8; 64 * 1024]).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = worker()
            .run(&request(&source, &destination, 64 * 1024), |_| {}, &cancel)
            .await;

        match outcome {
            CopyOutcome::Error { message } => {
                assert_eq!(message, CANCELLED_MESSAGE)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn zero_byte_file_completes_with_full_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty");
        let destination = dir.path().join("empty-copy");
        std::fs::write(&source, b"").unwrap();

        let reports: Mutex<Vec<CopyProgress>> = Mutex::new(Vec::new());
        let outcome = worker()
            .run(
                &request(&source, &destination, 0),
                |report| reports.lock().unwrap().push(report),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            CopyOutcome::Completed { bytes_copied: 0, .. }
        ));
        let reports = reports.into_inner().unwrap();
        assert_eq!(reports.last().map(|r| r.bytes_copied), Some(0));
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.bin");
        let destination = dir.path().join("data-copy.bin");
        std::fs::write(&source, vec![1u8; 32 * 1024]).unwrap();

        let reports: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        let small_chunks =
            CopyWorker::new(HashAlgorithm::Xxhash3, 1024, Duration::from_millis(0));
        let outcome = small_chunks
            .run(
                &request(&source, &destination, 32 * 1024),
                |report| reports.lock().unwrap().push(report.bytes_copied),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, CopyOutcome::Completed { .. }));
        let reports = reports.into_inner().unwrap();
        assert!(reports.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(reports.last(), Some(&(32 * 1024)));
    }
}
