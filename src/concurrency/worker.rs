// src/concurrency/worker.rs

//! Dispatch loop run by every adaptive pool thread

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::adaptive::PoolShared;
use super::item::WorkItem;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Owned handle to a running worker thread
#[derive(Debug)]
pub(super) struct WorkerHandle {
    pub(super) id: usize,
    pub(super) name: String,
    pub(super) thread: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    /// Idle past the threshold while above the floor
    Retired,
    /// Pool disposal
    Stopped,
}

pub(super) fn run(shared: Arc<PoolShared>, id: usize, name: String) {
    tracing::debug!(worker = %name, "Worker started");

    let limits = &shared.limits;
    let mut idle_since = Instant::now();

    let exit = loop {
        if shared.is_shutting_down() {
            break WorkerExit::Stopped;
        }

        shared.signal.wait(limits.wake_timeout);
        if shared.is_shutting_down() {
            break WorkerExit::Stopped;
        }

        let mut drained = 0usize;
        while let Some(item) = next_item(&shared) {
            execute(&shared, &name, item);
            drained += 1;
        }

        if drained > 0 {
            tracing::trace!(worker = %name, drained, "Queue drained");
            idle_since = Instant::now();
        }

        if shared.queue.is_empty() && !shared.is_shutting_down() {
            shared.signal.reset();
            // An item may have been enqueued between the emptiness check and the reset
            if !shared.queue.is_empty() {
                shared.signal.set();
            }
        }

        if idle_since.elapsed() >= limits.idle_timeout && shared.try_retire(id) {
            break WorkerExit::Retired;
        }
    };

    match exit {
        WorkerExit::Retired => tracing::debug!(
            worker = %name,
            idle_ms = idle_since.elapsed().as_millis() as u64,
            "Worker retired"
        ),
        WorkerExit::Stopped => tracing::debug!(worker = %name, "Worker stopped"),
    }
}

fn next_item(shared: &PoolShared) -> Option<WorkItem> {
    if shared.is_shutting_down() {
        return None;
    }
    shared.queue.try_dequeue()
}

fn execute(shared: &PoolShared, worker: &str, item: WorkItem) {
    let item_id = item.id();
    let queued_ms = item.queued_for().as_millis() as u64;

    let outcome = {
        let _busy = shared.counters.enter_busy();
        item.run()
    };

    match &outcome {
        Ok(()) => tracing::trace!(worker, item = %item_id, queued_ms, "Work item completed"),
        Err(failure) => tracing::error!(
            worker,
            item = %item_id,
            queued_ms,
            error = %failure,
            "Work item failed"
        ),
    }

    shared.counters.record_outcome(outcome.is_err());
}

/// Joins workers until `deadline`; returns `(joined, detached)`.
///
/// Threads still running at the deadline are detached. A handle for the
/// calling thread is never joined.
pub(super) fn join_bounded(handles: Vec<WorkerHandle>, deadline: Instant) -> (usize, usize) {
    let current = thread::current().id();
    let (mut pending, own): (Vec<_>, Vec<_>) = handles
        .into_iter()
        .partition(|handle| handle.thread.thread().id() != current);

    let mut joined = 0;
    loop {
        let (finished, running): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|handle| handle.thread.is_finished());

        for handle in finished {
            if handle.thread.join().is_err() {
                tracing::warn!(worker = %handle.name, "Worker thread terminated abnormally");
            }
            joined += 1;
        }

        pending = running;
        let now = Instant::now();
        if pending.is_empty() || now >= deadline {
            break;
        }
        thread::sleep(JOIN_POLL_INTERVAL.min(deadline - now));
    }

    for handle in &pending {
        tracing::warn!(
            worker = %handle.name,
            "Worker still running at shutdown deadline, detaching"
        );
    }

    (joined, pending.len() + own.len())
}
