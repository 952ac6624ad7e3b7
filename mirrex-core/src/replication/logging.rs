use tracing::info;

/// Normalized record handed to the copy logger for every worker outcome.
#[derive(Debug, Clone)]
pub struct CopyLogRecord {
    pub bucket_name: String,
    pub source_path: String,
    pub source_folder: String,
    pub file_size: u64,
    pub source_hash: Option<String>,
    pub worker_id: i64,
    pub message: Option<String>,
}

/// Interface of the external multi-channel log sink. The core only knows how
/// to hand it normalized records; appending, rotation and channel routing
/// live outside.
pub trait CopyLogger: Send + Sync {
    fn log(&self, status_label: &str, record: CopyLogRecord);
    fn system(&self, message: &str);
}

/// Default logger that forwards records as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCopyLogger;

impl CopyLogger for TracingCopyLogger {
    fn log(&self, status_label: &str, record: CopyLogRecord) {
        info!(
            target: "mirrex::copy",
            status = status_label,
            bucket = %record.bucket_name,
            source = %record.source_path,
            folder = %record.source_folder,
            size = record.file_size,
            hash = record.source_hash.as_deref().unwrap_or(""),
            worker = record.worker_id,
            message = record.message.as_deref().unwrap_or(""),
        );
    }

    fn system(&self, message: &str) {
        info!(target: "mirrex::system", "{message}");
    }
}

/// Logger that swallows everything; test-friendly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCopyLogger;

impl CopyLogger for NullCopyLogger {
    fn log(&self, _status_label: &str, _record: CopyLogRecord) {}
    fn system(&self, _message: &str) {}
}
