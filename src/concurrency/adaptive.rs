// src/concurrency/adaptive.rs

//! Dedicated-thread pool that grows under load and shrinks back to its floor
//!
//! Growth is decided by submitters: whenever the backlog exceeds the number
//! of free workers a batch of threads is added, up to the ceiling. Shrinking
//! is decided by the workers themselves, each retiring once it has been idle
//! past the threshold while sitting above the floor. The worker collection
//! lock is only taken for those two resize paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::diagnostics::{PoolCounters, PoolStatus};
use super::gate::IntakeGate;
use super::item::WorkItem;
use super::queue::WorkQueue;
use super::signal::WakeSignal;
use super::worker::{self, WorkerHandle};
use super::{PoolLimits, ShutdownReport, WorkPool};
use crate::config::{PoolConfig, PoolKind};
use crate::error::{Error, PoolOperation, Result};

/// State shared between the pool handle and its worker threads
pub(super) struct PoolShared {
    pub(super) limits: PoolLimits,
    pub(super) queue: WorkQueue,
    pub(super) signal: WakeSignal,
    pub(super) counters: PoolCounters,
    workers: Mutex<Vec<WorkerHandle>>,
    worker_count: AtomicUsize,
    next_worker_id: AtomicUsize,
    intake: IntakeGate,
}

impl PoolShared {
    fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            queue: WorkQueue::new(),
            signal: WakeSignal::new(),
            counters: PoolCounters::default(),
            workers: Mutex::new(Vec::new()),
            worker_count: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            intake: IntakeGate::default(),
        }
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.intake.is_closed()
    }

    /// Removes worker `id` from the collection if it sits above the floor.
    ///
    /// Only positions at or beyond `min_workers` may leave, so the collection
    /// never drops below the floor and a slot is never vacated twice.
    pub(super) fn try_retire(&self, id: usize) -> bool {
        if self.worker_count.load(Ordering::SeqCst) <= self.limits.min_workers {
            return false;
        }

        let mut workers = self.workers.lock();
        if self.is_shutting_down() || !self.queue.is_empty() {
            return false;
        }

        let Some(position) = workers.iter().position(|w| w.id == id) else {
            return false;
        };
        if position < self.limits.min_workers {
            return false;
        }

        // The thread is on its way out; dropping its handle detaches it
        workers.swap_remove(position);
        self.worker_count.store(workers.len(), Ordering::SeqCst);
        self.counters.record_retired();
        true
    }

    fn needs_growth(&self, total_workers: usize) -> bool {
        let depth = self.queue.len();
        let idle = total_workers.saturating_sub(self.counters.busy());
        depth > 0 && depth > idle && total_workers < self.limits.max_workers
    }

    fn grow_if_needed(self: &Arc<Self>) {
        if !self.needs_growth(self.worker_count.load(Ordering::SeqCst)) {
            return;
        }

        let mut workers = self.workers.lock();
        if self.is_shutting_down() || !self.needs_growth(workers.len()) {
            return;
        }

        let batch = self
            .limits
            .growth_batch
            .min(self.limits.max_workers - workers.len());

        let mut added = 0;
        for _ in 0..batch {
            match self.spawn_worker(PoolOperation::Spawn) {
                Ok(handle) => {
                    workers.push(handle);
                    added += 1;
                }
                Err(e) => {
                    // Queued work is still served by the existing workers
                    tracing::error!(error = %e, "Failed to grow worker pool");
                    break;
                }
            }
        }
        self.worker_count.store(workers.len(), Ordering::SeqCst);

        if added > 0 {
            tracing::debug!(
                added,
                total_workers = workers.len(),
                queue_depth = self.queue.len(),
                "Worker pool grew"
            );
        }
    }

    fn spawn_worker(self: &Arc<Self>, operation: PoolOperation) -> Result<WorkerHandle> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.limits.thread_name_prefix, id);

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = self.limits.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker_shared = Arc::clone(self);
        let worker_name = name.clone();
        let thread = builder
            .spawn(move || worker::run(worker_shared, id, worker_name))
            .map_err(|e| Error::spawn_failed(name.as_str(), operation, e))?;

        self.counters.record_spawned();
        Ok(WorkerHandle { id, name, thread })
    }

    fn stop_workers(&self, handles: Vec<WorkerHandle>, timeout: Duration) -> (usize, usize) {
        self.intake.close();
        self.signal.set();
        worker::join_bounded(handles, Instant::now() + timeout)
    }
}

/// Worker pool backed by dedicated OS threads
pub struct AdaptivePool {
    shared: Arc<PoolShared>,
}

impl AdaptivePool {
    /// Starts the minimum worker set.
    ///
    /// Fails without leaving any thread behind if a single floor worker
    /// cannot be started.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let limits = PoolLimits::resolve(config)?;
        let shared = Arc::new(PoolShared::new(limits));

        let mut started = Vec::with_capacity(shared.limits.min_workers);
        for _ in 0..shared.limits.min_workers {
            match shared.spawn_worker(PoolOperation::Start) {
                Ok(handle) => started.push(handle),
                Err(e) => {
                    let (joined, detached) = shared.stop_workers(started, shared.limits.shutdown_timeout);
                    tracing::error!(
                        error = %e,
                        joined,
                        detached,
                        "Worker pool construction failed"
                    );
                    return Err(e);
                }
            }
        }

        {
            let mut workers = shared.workers.lock();
            workers.extend(started);
            shared.worker_count.store(workers.len(), Ordering::SeqCst);
        }

        tracing::info!(
            min_workers = shared.limits.min_workers,
            max_workers = shared.limits.max_workers,
            growth_batch = shared.limits.growth_batch,
            idle_timeout_ms = shared.limits.idle_timeout.as_millis() as u64,
            "Adaptive worker pool started"
        );

        Ok(Self { shared })
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.shared.limits
    }

    /// Total workers spawned and retired over the pool's lifetime
    pub fn lifetime_counts(&self) -> (u64, u64) {
        (self.shared.counters.spawned(), self.shared.counters.retired())
    }
}

impl WorkPool for AdaptivePool {
    fn kind(&self) -> PoolKind {
        PoolKind::Adaptive
    }

    fn submit_item(&self, item: WorkItem) -> Result<()> {
        let shared = &self.shared;
        let _permit = shared.intake.enter().ok_or_else(Error::pool_closed)?;

        shared.queue.enqueue(item);
        shared.counters.record_submitted();
        shared.grow_if_needed();
        shared.signal.set();
        Ok(())
    }

    fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        shared.counters.snapshot(
            PoolKind::Adaptive,
            shared.worker_count.load(Ordering::SeqCst),
            shared.queue.len(),
            (shared.limits.min_workers, shared.limits.max_workers),
            shared.is_shutting_down(),
        )
    }

    fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport> {
        let shared = &self.shared;
        if !shared.intake.close() {
            return Ok(ShutdownReport::default());
        }

        tracing::info!(
            total_workers = shared.worker_count.load(Ordering::SeqCst),
            queue_depth = shared.queue.len(),
            "Shutting down adaptive worker pool"
        );

        shared.intake.wait_drained();
        let handles = std::mem::take(&mut *shared.workers.lock());
        let (joined, detached) = shared.stop_workers(handles, timeout);
        shared.worker_count.store(detached, Ordering::SeqCst);

        let abandoned = shared.queue.discard_all();
        shared.counters.record_abandoned(abandoned);

        let report = ShutdownReport {
            joined,
            detached,
            abandoned,
        };
        if detached > 0 {
            tracing::warn!(joined, detached, abandoned, "Worker pool shut down with workers still running");
        } else {
            tracing::info!(joined, abandoned, "Adaptive worker pool shut down");
        }
        Ok(report)
    }

    fn is_shut_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

impl std::fmt::Debug for AdaptivePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptivePool")
            .field("limits", &self.shared.limits)
            .field("total_workers", &self.shared.worker_count.load(Ordering::Relaxed))
            .field("queue_depth", &self.shared.queue.len())
            .finish()
    }
}

impl Drop for AdaptivePool {
    fn drop(&mut self) {
        if !self.shared.is_shutting_down() {
            let timeout = self.shared.limits.shutdown_timeout;
            if let Err(e) = self.shutdown(timeout) {
                tracing::error!(error = %e, "Failed to shut down worker pool on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::WorkPoolExt;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};

    fn test_config(min: usize, cpus: usize, per_cpu: usize) -> PoolConfig {
        PoolConfig {
            min_workers: Some(min),
            cpu_count: Some(cpus),
            max_threads_per_cpu: per_cpu,
            idle_timeout_ms: 200,
            wake_timeout_ms: 20,
            shutdown_timeout_ms: 2_000,
            thread_name_prefix: "test-worker".to_string(),
            ..Default::default()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_starts_floor_workers() {
        let pool = AdaptivePool::new(&test_config(3, 2, 4)).unwrap();
        let status = pool.status();

        assert_eq!(status.total_workers, 3);
        assert_eq!(status.available_workers, 3);
        assert_eq!(status.min_workers, 3);
        assert_eq!(status.max_workers, 8);
        assert_eq!(status.kind, PoolKind::Adaptive);
    }

    #[test]
    fn test_exactly_once_execution() {
        const ITEMS: usize = 1_000;
        let pool = AdaptivePool::new(&test_config(2, 2, 4)).unwrap();
        let marks: Arc<Vec<AtomicU8>> = Arc::new((0..ITEMS).map(|_| AtomicU8::new(0)).collect());

        for i in 0..ITEMS {
            let marks = Arc::clone(&marks);
            pool.submit(move |index: usize| {
                marks[index].fetch_add(1, Ordering::SeqCst);
            }, i)
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(10), || {
            pool.status().completed_count == ITEMS as u64
        }));
        assert!(marks.iter().all(|m| m.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.status().errored_count, 0);
    }

    #[test]
    fn test_bounded_growth_under_burst() {
        let pool = AdaptivePool::new(&test_config(1, 1, 4)).unwrap();
        let mut peak = 0;

        for _ in 0..200 {
            pool.execute(|| thread::sleep(Duration::from_millis(2))).unwrap();
            let total = pool.status().total_workers;
            assert!(total <= 4);
            peak = peak.max(total);
        }

        assert!(peak > 1);
        assert!(wait_until(Duration::from_secs(10), || pool.status().completed_count == 200));
        assert!(pool.status().total_workers <= 4);
    }

    #[test]
    fn test_burst_grows_then_shrinks_to_floor() {
        // min 2, max 8: 2 cpus x 4
        let pool = AdaptivePool::new(&test_config(2, 2, 4)).unwrap();

        for _ in 0..20 {
            pool.execute(|| thread::sleep(Duration::from_millis(50))).unwrap();
        }

        let during_burst = pool.status().total_workers;
        assert!(during_burst > 2, "pool did not grow: {}", during_burst);
        assert!(during_burst <= 8);

        assert!(wait_until(Duration::from_secs(5), || pool.status().is_quiescent()));
        assert_eq!(pool.status().queue_depth, 0);

        // Twice the idle threshold plus slack for wake timeouts
        assert!(wait_until(Duration::from_millis(2 * 200 + 1_000), || {
            pool.status().total_workers == 2
        }));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.status().total_workers, 2);

        let (spawned, retired) = pool.lifetime_counts();
        assert_eq!(spawned - retired, 2);
    }

    #[test]
    fn test_failure_isolation() {
        let pool = AdaptivePool::new(&test_config(1, 1, 2)).unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        pool.submit(|divisor: i32| {
            let _ = 100 / divisor;
        }, 0)
        .unwrap();

        let flag_clone = Arc::clone(&flag);
        pool.execute(move || flag_clone.store(true, Ordering::SeqCst)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.status().completed_count == 2));
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(pool.status().errored_count, 1);
        assert!(pool.status().total_workers >= 1);
    }

    #[test]
    fn test_each_failure_counted_once() {
        let pool = AdaptivePool::new(&test_config(2, 2, 2)).unwrap();

        for i in 0..10u32 {
            pool.submit_fallible(|n: u32| {
                if n % 2 == 0 {
                    Err(format!("rejected {}", n))
                } else {
                    Ok(())
                }
            }, i)
            .unwrap();
        }
        pool.execute(|| panic!("unexpected state")).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.status().completed_count == 11));
        assert_eq!(pool.status().errored_count, 6);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = AdaptivePool::new(&test_config(2, 2, 2)).unwrap();
        let report = pool.shutdown(Duration::from_secs(2)).unwrap();

        assert_eq!(report.joined, 2);
        assert_eq!(report.detached, 0);

        let err = pool.execute(|| {}).unwrap_err();
        assert!(err.is_pool_closed());
        assert!(pool.is_shut_down());
        assert_eq!(pool.status().total_workers, 0);
    }

    #[test]
    fn test_shutdown_finishes_in_flight_and_abandons_queued() {
        let pool = AdaptivePool::new(&test_config(1, 1, 1)).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let executed_later = Arc::new(AtomicU64::new(0));

        {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            pool.execute(move || {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)));

        for _ in 0..25 {
            let executed_later = Arc::clone(&executed_later);
            pool.execute(move || {
                executed_later.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let report = pool.shutdown(Duration::from_secs(5)).unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(report.abandoned, 25);
        assert_eq!(report.detached, 0);

        thread::sleep(Duration::from_millis(50));
        let status = pool.status();
        assert_eq!(executed_later.load(Ordering::SeqCst), 0);
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.abandoned_count, 25);
        assert_eq!(status.queue_depth, 0);
    }

    #[test]
    fn test_concurrent_submitters_exactly_once_within_ceiling() {
        const SUBMITTERS: usize = 8;
        const PER_SUBMITTER: usize = 3_000;
        const ITEMS: usize = SUBMITTERS * PER_SUBMITTER;

        // min 2, max 8
        let pool = AdaptivePool::new(&test_config(2, 2, 4)).unwrap();
        let max_workers = pool.limits().max_workers;
        let marks: Arc<Vec<AtomicU8>> = Arc::new((0..ITEMS).map(|_| AtomicU8::new(0)).collect());

        thread::scope(|scope| {
            for submitter in 0..SUBMITTERS {
                let pool = &pool;
                let marks = &marks;
                scope.spawn(move || {
                    for i in 0..PER_SUBMITTER {
                        let marks = Arc::clone(marks);
                        pool.submit(move |index: usize| {
                            marks[index].fetch_add(1, Ordering::SeqCst);
                        }, submitter * PER_SUBMITTER + i)
                        .unwrap();

                        let total = pool.status().total_workers;
                        assert!(total <= max_workers, "{} workers above ceiling {}", total, max_workers);
                    }
                });
            }
        });

        assert!(wait_until(Duration::from_secs(20), || {
            pool.status().completed_count == ITEMS as u64
        }));
        assert!(marks.iter().all(|m| m.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.status().submitted_count, ITEMS as u64);
        assert!(pool.status().total_workers <= max_workers);
    }

    #[test]
    fn test_submitters_racing_shutdown_lose_nothing() {
        for _ in 0..10 {
            let pool = AdaptivePool::new(&test_config(2, 2, 2)).unwrap();
            let executed = Arc::new(AtomicU64::new(0));

            let (accepted, report) = thread::scope(|scope| {
                let submitters: Vec<_> = (0..4)
                    .map(|_| {
                        let pool = &pool;
                        let executed = &executed;
                        scope.spawn(move || {
                            let mut accepted = 0u64;
                            loop {
                                let executed = Arc::clone(executed);
                                match pool.execute(move || {
                                    executed.fetch_add(1, Ordering::SeqCst);
                                }) {
                                    Ok(()) => accepted += 1,
                                    Err(e) => {
                                        assert!(e.is_pool_closed());
                                        break accepted;
                                    }
                                }
                            }
                        })
                    })
                    .collect();

                thread::sleep(Duration::from_millis(10));
                let report = pool.shutdown(Duration::from_secs(5)).unwrap();
                let accepted: u64 = submitters.into_iter().map(|s| s.join().unwrap()).sum();
                (accepted, report)
            });

            assert_eq!(report.detached, 0);
            let executed = executed.load(Ordering::SeqCst);
            assert_eq!(executed + report.abandoned as u64, accepted);

            let status = pool.status();
            assert_eq!(status.completed_count, executed);
            assert_eq!(status.abandoned_count, report.abandoned as u64);
            assert_eq!(status.submitted_count, accepted);
        }
    }

    #[test]
    fn test_second_shutdown_is_empty() {
        let pool = AdaptivePool::new(&test_config(1, 1, 1)).unwrap();
        pool.shutdown(Duration::from_secs(1)).unwrap();

        assert_eq!(pool.shutdown(Duration::from_secs(1)).unwrap(), ShutdownReport::default());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        // Floor of 9 above a ceiling of 1 cpu x 2
        assert!(AdaptivePool::new(&test_config(9, 1, 2)).is_err());
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_construction_fails_when_threads_cannot_start() {
        let config = PoolConfig {
            stack_size: Some(1 << 50),
            ..test_config(2, 1, 2)
        };

        let err = AdaptivePool::new(&config).unwrap_err();
        assert!(err.is_critical());
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::Pool { operation: PoolOperation::Start, .. }
        ));
    }
}
