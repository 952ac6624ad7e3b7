use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the replication core: scheduler cadence, claim sizing, cache
/// TTLs, event batching, and shutdown policy. All values are policy, not
/// contract; the defaults match the behaviour the control plane expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Scheduler tick while work was found or workers are active (ms).
    pub busy_tick_ms: u64,
    /// Scheduler tick while the bucket is idle (ms).
    pub idle_tick_ms: u64,
    /// TTL for the per-folder activity snapshot the scheduler reads (ms).
    /// Invalidated early on every successful claim.
    pub folder_cache_ttl_ms: u64,
    /// Upper bound on rows claimed in one batch, independent of free worker
    /// slots.
    pub claim_batch_limit: usize,
    /// Minimum interval between progress callbacks per copy (ms).
    pub progress_interval_ms: u64,
    /// Flush cadence of the progress-event batcher (ms).
    pub progress_flush_ms: u64,
    /// Capacity of the broadcast event channel.
    pub event_channel_capacity: usize,
    /// Hard upper bound the graceful-shutdown wrapper waits for workers (s).
    pub shutdown_timeout_secs: u64,
    /// SQLite busy timeout (ms).
    pub busy_timeout_ms: u64,
    /// Connection-pool size for the queue database.
    pub max_connections: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            busy_tick_ms: 200,
            idle_tick_ms: 1_000,
            folder_cache_ttl_ms: 2_000,
            claim_batch_limit: 16,
            progress_interval_ms: 500,
            progress_flush_ms: 500,
            event_channel_capacity: 256,
            shutdown_timeout_secs: 30,
            busy_timeout_ms: 5_000,
            max_connections: 5,
        }
    }
}

impl ReplicationConfig {
    pub fn busy_tick(&self) -> Duration {
        Duration::from_millis(self.busy_tick_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn folder_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.folder_cache_ttl_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn progress_flush(&self) -> Duration {
        Duration::from_millis(self.progress_flush_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
