// src/concurrency/native.rs

//! Pool variant backed by the tokio blocking thread pool
//!
//! The runtime owns thread creation and idle reaping: threads are started
//! lazily up to the ceiling and exit after the idle threshold, so this
//! variant has no floor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use super::diagnostics::{PoolCounters, PoolStatus};
use super::gate::IntakeGate;
use super::item::WorkItem;
use super::{PoolLimits, ShutdownReport, WorkPool};
use crate::config::{PoolConfig, PoolKind};
use crate::error::{Error, PoolOperation, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct NativeShared {
    limits: PoolLimits,
    counters: PoolCounters,
    intake: IntakeGate,
    /// Items handed to the runtime that have not started yet
    queued: AtomicUsize,
    /// Live runtime threads, including the single scheduler thread
    threads: AtomicUsize,
}

impl NativeShared {
    fn total_workers(&self) -> usize {
        self.threads.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Shutdown polls `busy` and `queued`; each item leaves `queued` only
    /// after it is accounted for elsewhere
    fn execute(&self, item: WorkItem) {
        if self.intake.is_closed() {
            self.counters.record_abandoned(1);
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let _busy = self.counters.enter_busy();
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let item_id = item.id();
        let outcome = item.run();
        if let Err(failure) = &outcome {
            tracing::error!(
                worker = thread::current().name().unwrap_or("native"),
                item = %item_id,
                error = %failure,
                "Work item failed"
            );
        }
        self.counters.record_outcome(outcome.is_err());
    }
}

/// Worker pool that delegates threads to a dedicated tokio runtime
pub struct NativePool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shared: Arc<NativeShared>,
}

impl NativePool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let limits = PoolLimits::resolve(config)?;
        let shared = Arc::new(NativeShared {
            limits,
            counters: PoolCounters::default(),
            intake: IntakeGate::default(),
            queued: AtomicUsize::new(0),
            threads: AtomicUsize::new(0),
        });

        let on_start = Arc::clone(&shared);
        let on_stop = Arc::clone(&shared);
        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(1)
            .max_blocking_threads(shared.limits.max_workers)
            .thread_keep_alive(shared.limits.idle_timeout)
            .thread_name(shared.limits.thread_name_prefix.clone())
            .on_thread_start(move || {
                on_start.threads.fetch_add(1, Ordering::SeqCst);
                on_start.counters.record_spawned();
            })
            .on_thread_stop(move || {
                on_stop.threads.fetch_sub(1, Ordering::SeqCst);
                on_stop.counters.record_retired();
            });
        if let Some(stack_size) = shared.limits.stack_size {
            builder.thread_stack_size(stack_size);
        }

        let runtime = builder.build().map_err(|e| {
            Error::spawn_failed(
                shared.limits.thread_name_prefix.as_str(),
                PoolOperation::Start,
                e,
            )
        })?;

        tracing::info!(
            max_workers = shared.limits.max_workers,
            idle_timeout_ms = shared.limits.idle_timeout.as_millis() as u64,
            "Native worker pool started"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            shared,
        })
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.shared.limits
    }
}

impl WorkPool for NativePool {
    fn kind(&self) -> PoolKind {
        PoolKind::Native
    }

    fn submit_item(&self, item: WorkItem) -> Result<()> {
        let shared = &self.shared;
        let _permit = shared.intake.enter().ok_or_else(Error::pool_closed)?;

        shared.queued.fetch_add(1, Ordering::SeqCst);
        shared.counters.record_submitted();

        let task_shared = Arc::clone(shared);
        // Fire-and-forget: the join handle is dropped
        drop(self.handle.spawn_blocking(move || task_shared.execute(item)));
        Ok(())
    }

    fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        let queue_depth = if self.runtime.lock().is_some() {
            shared.queued.load(Ordering::SeqCst)
        } else {
            0
        };

        shared.counters.snapshot(
            PoolKind::Native,
            shared.total_workers(),
            queue_depth,
            (0, shared.limits.max_workers),
            shared.intake.is_closed(),
        )
    }

    fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport> {
        let shared = &self.shared;
        if !shared.intake.close() {
            return Ok(ShutdownReport::default());
        }

        tracing::info!(
            busy_workers = shared.counters.busy(),
            queue_depth = shared.queued.load(Ordering::SeqCst),
            "Shutting down native worker pool"
        );
        shared.intake.wait_drained();

        // Queued items skip themselves once the gate is closed; wait for
        // those and for in-flight callbacks
        let deadline = Instant::now() + timeout;
        while shared.counters.busy() > 0 || shared.queued.load(Ordering::SeqCst) > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(DRAIN_POLL_INTERVAL.min(deadline - now));
        }

        let detached = shared.counters.busy();
        let never_started = shared.queued.load(Ordering::SeqCst);
        shared.counters.record_abandoned(never_started);
        let joined = shared.total_workers().saturating_sub(detached);

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }

        let report = ShutdownReport {
            joined,
            detached,
            abandoned: shared.counters.abandoned() as usize,
        };
        if detached > 0 {
            tracing::warn!(
                joined,
                detached,
                abandoned = report.abandoned,
                "Native pool shut down with callbacks still running"
            );
        } else {
            tracing::info!(joined, abandoned = report.abandoned, "Native worker pool shut down");
        }
        Ok(report)
    }

    fn is_shut_down(&self) -> bool {
        self.shared.intake.is_closed()
    }
}

impl std::fmt::Debug for NativePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePool")
            .field("limits", &self.shared.limits)
            .field("threads", &self.shared.total_workers())
            .finish()
    }
}

impl Drop for NativePool {
    fn drop(&mut self) {
        if !self.shared.intake.is_closed() {
            let timeout = self.shared.limits.shutdown_timeout;
            if let Err(e) = self.shutdown(timeout) {
                tracing::error!(error = %e, "Failed to shut down native pool on drop");
            }
        }
        // Never block on runtime teardown here; this may run inside async code
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
