// src/concurrency/mod.rs

//! Background worker pools
//!
//! This module provides the pool abstraction and its two implementations:
//! - [`AdaptivePool`], dedicated threads that grow under load and retire when idle
//! - [`NativePool`], the tokio blocking thread pool behind the same contract
//! - Ambient context capture and restoration around each callback
//! - Failure isolation for panicking or failing callbacks
//! - Lock-free diagnostics and a periodic probe that republishes them
//!
//! The pool is built once at startup with [`build_pool`] and handed to every
//! collaborator as an `Arc<dyn WorkPool>`.

pub mod adaptive;
pub mod context;
pub mod diagnostics;
mod gate;
pub mod item;
pub mod native;
pub mod probe;
pub mod queue;
pub mod signal;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{PoolConfig, PoolKind};
use crate::error::{Error, ManagerOperation, PoolOperation, Result};
use crate::manager::{HealthStatus, ManagedState, Manager, ManagerState, ManagerStatus};

pub use adaptive::AdaptivePool;
pub use context::{ContextGuard, ExecutionContext};
pub use diagnostics::PoolStatus;
pub use item::{ItemFailure, WorkItem};
pub use native::NativePool;
pub use probe::{InstrumentSink, PoolProbe, ProbeHandle, TracingSink};
pub use queue::WorkQueue;
pub use signal::WakeSignal;

/// Effective sizing and timing of a pool, resolved from [`PoolConfig`] once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolLimits {
    pub logical_cpus: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub growth_batch: usize,
    pub idle_timeout: Duration,
    pub wake_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl PoolLimits {
    pub fn resolve(config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            logical_cpus: config.logical_cpus(),
            min_workers: config.min_workers(),
            max_workers: config.max_workers(),
            growth_batch: config.growth_batch(),
            idle_timeout: config.idle_timeout(),
            wake_timeout: config.wake_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            thread_name_prefix: config.thread_name_prefix.clone(),
            stack_size: config.stack_size,
        })
    }
}

/// Outcome of disposing a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Workers that stopped within the timeout
    pub joined: usize,
    /// Workers still running a callback when the timeout expired
    pub detached: usize,
    /// Queued items discarded without running
    pub abandoned: usize,
}

/// A pool that runs submitted work on background threads.
///
/// Submission is fire-and-forget: once `submit_item` returns `Ok` the caller
/// is detached from the item. Callback failures are counted in
/// [`PoolStatus::errored_count`] and logged, never reported back. Items still
/// queued when the pool is disposed are dropped without running and without
/// notifying their submitters.
pub trait WorkPool: Send + Sync + fmt::Debug {
    fn kind(&self) -> PoolKind;

    /// Enqueues an item, failing only once the pool has been shut down
    fn submit_item(&self, item: WorkItem) -> Result<()>;

    /// Diagnostics snapshot; never blocks the workers
    fn status(&self) -> PoolStatus;

    /// Stops intake, lets in-flight callbacks finish within `timeout` and
    /// abandons everything still queued. Repeated calls return an empty report.
    fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport>;

    fn is_shut_down(&self) -> bool {
        self.status().is_shut_down
    }
}

/// Convenience submission helpers available on every pool
#[async_trait]
pub trait WorkPoolExt: WorkPool {
    /// Runs `callback(argument)` on a worker under the caller's current context
    fn submit<F, A>(&self, callback: F, argument: A) -> Result<()>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static;

    fn submit_with_context<F, A>(
        &self,
        callback: F,
        argument: A,
        context: Arc<ExecutionContext>,
    ) -> Result<()>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static;

    /// Like `submit`, but an `Err` from the callback counts as a failure
    fn submit_fallible<F, A, E>(&self, callback: F, argument: A) -> Result<()>
    where
        F: FnOnce(A) -> std::result::Result<(), E> + Send + 'static,
        A: Send + 'static,
        E: fmt::Display;

    fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static;

    /// Runs `task` on the pool and waits for its result.
    ///
    /// Fails if the task panics or is abandoned at shutdown.
    async fn run_async<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static;
}

#[async_trait]
impl<P: WorkPool + ?Sized> WorkPoolExt for P {
    fn submit<F, A>(&self, callback: F, argument: A) -> Result<()>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        self.submit_item(WorkItem::new(callback, argument).with_optional_context(context::current()))
    }

    fn submit_with_context<F, A>(
        &self,
        callback: F,
        argument: A,
        context: Arc<ExecutionContext>,
    ) -> Result<()>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        self.submit_item(WorkItem::new(callback, argument).with_context(context))
    }

    fn submit_fallible<F, A, E>(&self, callback: F, argument: A) -> Result<()>
    where
        F: FnOnce(A) -> std::result::Result<(), E> + Send + 'static,
        A: Send + 'static,
        E: fmt::Display,
    {
        self.submit_item(WorkItem::fallible(callback, argument).with_optional_context(context::current()))
    }

    fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move |()| task(), ())
    }

    async fn run_async<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.execute(move || {
            let _ = tx.send(task());
        })?;

        rx.await.map_err(|_| {
            Error::pool(
                PoolOperation::Await,
                "Work item did not produce a result; it failed or was abandoned at shutdown",
            )
        })
    }
}

/// Builds the pool variant selected by `config.kind`
pub fn build_pool(config: &PoolConfig) -> Result<Arc<dyn WorkPool>> {
    let pool: Arc<dyn WorkPool> = match config.kind {
        PoolKind::Adaptive => Arc::new(AdaptivePool::new(config)?),
        PoolKind::Native => Arc::new(NativePool::new(config)?),
    };
    Ok(pool)
}

/// Owns the process-wide pool and ties it to the manager lifecycle
#[derive(Debug)]
pub struct ConcurrencyManager {
    state: ManagedState,
    config: PoolConfig,
    pool: Option<Arc<dyn WorkPool>>,
}

impl ConcurrencyManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "concurrency_manager"),
            config,
            pool: None,
        }
    }

    /// Handle to the running pool for injection into collaborators
    pub fn pool(&self) -> Result<Arc<dyn WorkPool>> {
        self.pool.clone().ok_or_else(|| {
            Error::manager(
                self.name(),
                ManagerOperation::Operation("pool".to_string()),
                "Worker pool is not running",
            )
        })
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(|pool| pool.status())
    }
}

#[async_trait]
impl Manager for ConcurrencyManager {
    fn name(&self) -> &str {
        "concurrency_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        match build_pool(&self.config) {
            Ok(pool) => {
                self.pool = Some(pool);
                self.state.set_health(HealthStatus::Healthy).await;
                self.state.set_state(ManagerState::Running).await;
                Ok(())
            }
            Err(e) => {
                self.state.set_state(ManagerState::Error).await;
                self.state.set_message(e.message.clone()).await;
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;

        if let Some(pool) = self.pool.take() {
            let timeout = self.config.shutdown_timeout();
            // Disposal joins threads; keep it off the async workers
            let report = tokio::task::spawn_blocking(move || pool.shutdown(timeout))
                .await
                .map_err(|e| {
                    Error::manager(
                        "concurrency_manager",
                        ManagerOperation::Shutdown,
                        format!("Pool shutdown task failed: {}", e),
                    )
                })??;

            tracing::info!(
                joined = report.joined,
                detached = report.detached,
                abandoned = report.abandoned,
                "Concurrency manager disposed worker pool"
            );

            if report.detached > 0 {
                let message = format!(
                    "{} worker(s) still running after the {:?} shutdown timeout",
                    report.detached, timeout
                );
                self.state.set_state(ManagerState::Error).await;
                self.state.set_message(message.clone()).await;
                return Err(Error::timeout(message)
                    .source("concurrency_manager")
                    .metadata("detached", serde_json::Value::from(report.detached)));
            }
        }

        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        if let Some(pool_status) = self.pool_status() {
            if self.state.state().await == ManagerState::Running {
                let health = if pool_status.errored_count > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                self.state.set_health(health).await;
            }

            let mut status = self.state.status().await;
            if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(pool_status) {
                for (key, value) in fields {
                    status.add_metadata(key, value);
                }
            }
            return status;
        }

        self.state.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn small_config(kind: PoolKind) -> PoolConfig {
        PoolConfig {
            kind,
            min_workers: Some(2),
            cpu_count: Some(2),
            max_threads_per_cpu: 2,
            idle_timeout_ms: 200,
            wake_timeout_ms: 20,
            shutdown_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    async fn wait_for(pool: &Arc<dyn WorkPool>, mut condition: impl FnMut(&PoolStatus) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition(&pool.status()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn test_limits_resolved_from_config() {
        let limits = PoolLimits::resolve(&small_config(PoolKind::Adaptive)).unwrap();
        assert_eq!(limits.min_workers, 2);
        assert_eq!(limits.max_workers, 4);
        assert_eq!(limits.growth_batch, 2);
        assert_eq!(limits.wake_timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_build_pool_selects_variant() {
        for kind in [PoolKind::Adaptive, PoolKind::Native] {
            let pool = build_pool(&small_config(kind)).unwrap();
            assert_eq!(pool.kind(), kind);
            pool.shutdown(Duration::from_secs(2)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_async_returns_result() {
        let pool = build_pool(&small_config(PoolKind::Adaptive)).unwrap();

        let sum = pool.run_async(|| (1..=100u64).sum::<u64>()).await.unwrap();
        assert_eq!(sum, 5050);
    }

    #[tokio::test]
    async fn test_run_async_reports_panicked_task() {
        let pool = build_pool(&small_config(PoolKind::Adaptive)).unwrap();

        let err = pool
            .run_async(|| -> u32 { panic!("parse failure") })
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::Pool { operation: PoolOperation::Await, .. }
        ));
        assert!(wait_for(&pool, |s| s.errored_count == 1).await);
    }

    #[test]
    fn test_submit_captures_current_context() {
        let pool = build_pool(&small_config(PoolKind::Adaptive)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        {
            let _guard = context::enter(Arc::new(ExecutionContext::new().with_principal("ops")));
            pool.execute(move || {
                let principal = context::current().and_then(|c| c.principal().map(str::to_string));
                tx.send(principal).unwrap();
            })
            .unwrap();
        }

        let principal = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(principal.as_deref(), Some("ops"));
    }

    #[test]
    fn test_explicit_context_is_used() {
        let pool = build_pool(&small_config(PoolKind::Native)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let context = Arc::new(ExecutionContext::new().with_tenant("acme").with_locale("fr-FR"));

        pool.submit_with_context(move |greeting: &'static str| {
            let ctx = context::current().unwrap();
            tx.send(format!("{} {} {}", greeting, ctx.tenant().unwrap(), ctx.locale().unwrap())).unwrap();
        }, "bonjour", context)
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "bonjour acme fr-FR");
        pool.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[tokio::test]
    async fn test_manager_lifecycle_and_degraded_health() {
        let mut manager = ConcurrencyManager::new(small_config(PoolKind::Adaptive));
        assert!(manager.pool().is_err());

        manager.initialize().await.unwrap();
        assert_eq!(manager.health_check().await, HealthStatus::Healthy);

        let pool = manager.pool().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        pool.execute(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.execute(|| panic!("corrupt record")).unwrap();
        assert!(wait_for(&pool, |s| s.completed_count == 2).await);

        let status = manager.status().await;
        assert_eq!(status.state, ManagerState::Running);
        assert_eq!(status.health, HealthStatus::Degraded);
        assert_eq!(status.metadata.get("errored_count"), Some(&serde_json::Value::from(1)));
        assert_eq!(status.metadata.get("total_workers"), Some(&serde_json::Value::from(2)));

        manager.shutdown().await.unwrap();
        assert!(pool.is_shut_down());
        assert!(pool.execute(|| {}).unwrap_err().is_pool_closed());
        assert_eq!(manager.status().await.state, ManagerState::Shutdown);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manager_shutdown_times_out_on_stuck_callback() {
        let mut manager = ConcurrencyManager::new(PoolConfig {
            shutdown_timeout_ms: 50,
            ..small_config(PoolKind::Adaptive)
        });
        manager.initialize().await.unwrap();

        let pool = manager.pool().unwrap();
        pool.execute(|| std::thread::sleep(Duration::from_millis(500))).unwrap();
        assert!(wait_for(&pool, |s| s.busy_workers == 1).await);

        let err = manager.shutdown().await.unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::Timeout));
        assert_eq!(err.metadata.get("detached"), Some(&serde_json::Value::from(1)));
        assert!(pool.is_shut_down());
        assert_eq!(manager.status().await.state, ManagerState::Error);
    }

    #[tokio::test]
    async fn test_manager_initialize_fails_on_invalid_config() {
        let mut manager = ConcurrencyManager::new(PoolConfig {
            max_threads_per_cpu: 0,
            ..Default::default()
        });

        assert!(manager.initialize().await.is_err());
        assert_eq!(manager.status().await.state, ManagerState::Error);
        assert_eq!(manager.health_check().await, HealthStatus::Unhealthy);
    }
}
