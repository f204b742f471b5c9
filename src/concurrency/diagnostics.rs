// src/concurrency/diagnostics.rs

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::PoolKind;

/// Point-in-time view of a pool, safe to read while workers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub kind: PoolKind,
    pub total_workers: usize,
    /// Workers not currently running a callback
    pub available_workers: usize,
    pub queue_depth: usize,
    pub busy_workers: usize,
    /// Callbacks that panicked or returned an error
    pub errored_count: u64,
    /// Callbacks that ran to completion, successfully or not
    pub completed_count: u64,
    pub submitted_count: u64,
    /// Items discarded unexecuted at disposal
    pub abandoned_count: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub is_shut_down: bool,
}

impl PoolStatus {
    /// No queued work and no callback in flight
    pub fn is_quiescent(&self) -> bool {
        self.queue_depth == 0 && self.busy_workers == 0
    }
}

/// Lock-free counters updated on the dispatch path
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    busy: AtomicUsize,
    errored: AtomicU64,
    completed: AtomicU64,
    submitted: AtomicU64,
    abandoned: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Marks one worker busy until the guard drops
    pub(crate) fn enter_busy(&self) -> BusyGuard<'_> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard { counters: self }
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, failed: bool) {
        if failed {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_abandoned(&self, count: usize) {
        self.abandoned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub(crate) fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(
        &self,
        kind: PoolKind,
        total_workers: usize,
        queue_depth: usize,
        limits: (usize, usize),
        is_shut_down: bool,
    ) -> PoolStatus {
        // Separate atomic reads can race; keep the snapshot self-consistent
        let busy_workers = self.busy().min(total_workers);

        PoolStatus {
            kind,
            total_workers,
            available_workers: total_workers - busy_workers,
            queue_depth,
            busy_workers,
            errored_count: self.errored.load(Ordering::SeqCst),
            completed_count: self.completed.load(Ordering::SeqCst),
            submitted_count: self.submitted.load(Ordering::Relaxed),
            abandoned_count: self.abandoned.load(Ordering::Relaxed),
            min_workers: limits.0,
            max_workers: limits.1,
            is_shut_down,
        }
    }
}

pub(crate) struct BusyGuard<'a> {
    counters: &'a PoolCounters,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counters.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_guard_releases_on_unwind() {
        let counters = PoolCounters::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _busy = counters.enter_busy();
            assert_eq!(counters.busy(), 1);
            panic!("callback failure");
        }));

        assert!(result.is_err());
        assert_eq!(counters.busy(), 0);
    }

    #[test]
    fn test_snapshot_clamps_busy_to_total() {
        let counters = PoolCounters::default();
        let _a = counters.enter_busy();
        let _b = counters.enter_busy();

        let status = counters.snapshot(PoolKind::Adaptive, 1, 0, (1, 4), false);
        assert_eq!(status.busy_workers, 1);
        assert_eq!(status.available_workers, 0);
    }

    #[test]
    fn test_outcomes() {
        let counters = PoolCounters::default();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_outcome(false);
        counters.record_outcome(true);

        let status = counters.snapshot(PoolKind::Native, 2, 0, (0, 8), false);
        assert_eq!(status.submitted_count, 2);
        assert_eq!(status.completed_count, 2);
        assert_eq!(status.errored_count, 1);
        assert!(status.is_quiescent());
    }
}
