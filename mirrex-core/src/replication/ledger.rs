//! In-memory incremental statistics over the file queue.
//!
//! The ledger mirrors the ground-truth aggregate `(count, total_size)` per
//! (bucket, status) pair plus a global scope. Only the queue store mutates
//! it, while holding the store's write serialization, so at every
//! commit-quiescent point the ledger equals a `GROUP BY` over the queue
//! table. [`StatsLedger::replace`] rebuilds it from that oracle.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use mirrex_model::{BucketId, FileStatus};

/// `(count, total_size)` aggregate for one status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub count: u64,
    pub total_size: u64,
}

impl StatusTotals {
    fn add(&mut self, count: u64, total_size: u64) {
        self.count += count;
        self.total_size += total_size;
    }

    fn sub(&mut self, count: u64, total_size: u64) {
        self.count = self.count.saturating_sub(count);
        self.total_size = self.total_size.saturating_sub(total_size);
    }
}

/// Aggregates for every file status within one scope (global or bucket).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusBreakdown {
    pub pending: StatusTotals,
    pub in_progress: StatusTotals,
    pub completed: StatusTotals,
    pub error: StatusTotals,
    pub conflict: StatusTotals,
}

impl StatusBreakdown {
    pub fn get(&self, status: FileStatus) -> StatusTotals {
        match status {
            FileStatus::Pending => self.pending,
            FileStatus::InProgress => self.in_progress,
            FileStatus::Completed => self.completed,
            FileStatus::Error => self.error,
            FileStatus::Conflict => self.conflict,
        }
    }

    fn slot_mut(&mut self, status: FileStatus) -> &mut StatusTotals {
        match status {
            FileStatus::Pending => &mut self.pending,
            FileStatus::InProgress => &mut self.in_progress,
            FileStatus::Completed => &mut self.completed,
            FileStatus::Error => &mut self.error,
            FileStatus::Conflict => &mut self.conflict,
        }
    }

    pub fn total_count(&self) -> u64 {
        FileStatus::ALL
            .iter()
            .map(|status| self.get(*status).count)
            .sum()
    }
}

/// Owned snapshot returned to callers; O(1) to produce.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// `None` for the global scope.
    pub bucket_id: Option<BucketId>,
    pub breakdown: StatusBreakdown,
}

/// One row of the rebuild oracle (`GROUP BY bucket_id, status`).
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub bucket_id: BucketId,
    pub status: FileStatus,
    pub count: u64,
    pub total_size: u64,
}

#[derive(Default)]
struct LedgerState {
    global: StatusBreakdown,
    buckets: HashMap<i64, StatusBreakdown>,
}

/// Incremental counters per status, global and per bucket.
#[derive(Default)]
pub struct StatsLedger {
    inner: Mutex<LedgerState>,
}

impl std::fmt::Debug for StatsLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("StatsLedger")
            .field("bucket_count", &state.buckets.len())
            .field("global_rows", &state.global.total_count())
            .finish()
    }
}

impl StatsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows entered the queue in `status` (insert path).
    pub fn record_added(
        &self,
        bucket_id: BucketId,
        status: FileStatus,
        count: u64,
        total_size: u64,
    ) {
        if count == 0 {
            return;
        }
        let mut state = self.inner.lock();
        state.global.slot_mut(status).add(count, total_size);
        state
            .buckets
            .entry(bucket_id.as_i64())
            .or_default()
            .slot_mut(status)
            .add(count, total_size);
    }

    /// Rows moved `from` → `to` in one committed transaction.
    pub fn record_transition(
        &self,
        bucket_id: BucketId,
        from: FileStatus,
        to: FileStatus,
        count: u64,
        total_size: u64,
    ) {
        if count == 0 || from == to {
            return;
        }
        let mut state = self.inner.lock();
        state.global.slot_mut(from).sub(count, total_size);
        state.global.slot_mut(to).add(count, total_size);
        let bucket = state.buckets.entry(bucket_id.as_i64()).or_default();
        bucket.slot_mut(from).sub(count, total_size);
        bucket.slot_mut(to).add(count, total_size);
    }

    /// A bucket and all its rows were deleted.
    pub fn remove_bucket(&self, bucket_id: BucketId) {
        let mut state = self.inner.lock();
        if let Some(breakdown) = state.buckets.remove(&bucket_id.as_i64()) {
            for status in FileStatus::ALL {
                let totals = breakdown.get(status);
                state
                    .global
                    .slot_mut(status)
                    .sub(totals.count, totals.total_size);
            }
        }
    }

    /// O(1) read of one scope.
    pub fn snapshot(&self, bucket_id: Option<BucketId>) -> StatsSnapshot {
        let state = self.inner.lock();
        let breakdown = match bucket_id {
            None => state.global,
            Some(id) => state
                .buckets
                .get(&id.as_i64())
                .copied()
                .unwrap_or_default(),
        };
        StatsSnapshot {
            bucket_id,
            breakdown,
        }
    }

    /// Rebuild from the ground-truth aggregate. A no-op under steady state;
    /// the oracle if divergence is ever suspected.
    pub fn replace(&self, rows: impl IntoIterator<Item = LedgerRow>) {
        let mut fresh = LedgerState::default();
        for row in rows {
            fresh.global.slot_mut(row.status).add(row.count, row.total_size);
            fresh
                .buckets
                .entry(row.bucket_id.as_i64())
                .or_default()
                .slot_mut(row.status)
                .add(row.count, row.total_size);
        }
        *self.inner.lock() = fresh;
    }
}
