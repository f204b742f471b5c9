// src/concurrency/probe.rs

//! Periodic sampler that republishes pool diagnostics as named instruments

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::diagnostics::PoolStatus;
use super::WorkPool;
use crate::error::{Error, PoolOperation, Result};

pub const BUSY_WORKERS: &str = "pool.busy_workers";
pub const TOTAL_WORKERS: &str = "pool.total_workers";
pub const AVAILABLE_WORKERS: &str = "pool.available_workers";
pub const QUEUE_DEPTH: &str = "pool.queue_depth";
pub const ERRORED_WORKERS: &str = "pool.errored_workers";
pub const COMPLETED_ITEMS: &str = "pool.completed_items";

/// Destination for sampled instrument values
pub trait InstrumentSink: Send + Sync + fmt::Debug {
    fn record(&self, instrument: &'static str, value: u64);
}

/// Emits every sample as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl InstrumentSink for TracingSink {
    fn record(&self, instrument: &'static str, value: u64) {
        tracing::info!(target: "qorzen_workpool::metrics", instrument, value, "Pool gauge");
    }
}

/// Writes one value per instrument for `status`
pub fn publish(status: &PoolStatus, sink: &dyn InstrumentSink) {
    sink.record(BUSY_WORKERS, status.busy_workers as u64);
    sink.record(TOTAL_WORKERS, status.total_workers as u64);
    sink.record(AVAILABLE_WORKERS, status.available_workers as u64);
    sink.record(QUEUE_DEPTH, status.queue_depth as u64);
    sink.record(ERRORED_WORKERS, status.errored_count);
    sink.record(COMPLETED_ITEMS, status.completed_count);
}

pub struct PoolProbe {
    pool: Arc<dyn WorkPool>,
    sink: Arc<dyn InstrumentSink>,
    interval: Duration,
}

impl PoolProbe {
    pub fn new(pool: Arc<dyn WorkPool>, interval: Duration) -> Self {
        Self {
            pool,
            sink: Arc::new(TracingSink),
            interval,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn InstrumentSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Takes and publishes a single sample
    pub fn sample(&self) -> PoolStatus {
        let status = self.pool.status();
        publish(&status, self.sink.as_ref());
        status
    }

    /// Samples on the current tokio runtime until stopped or the pool shuts down
    pub fn spawn(self) -> ProbeHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut samples = 0u64;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let status = self.sample();
                        samples += 1;
                        if status.is_shut_down {
                            tracing::debug!(samples, "Pool shut down, probe stopping");
                            break;
                        }
                    }
                }
            }

            samples
        });

        ProbeHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

impl fmt::Debug for PoolProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolProbe")
            .field("pool", &self.pool.kind())
            .field("sink", &self.sink)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Running probe; dropping it also stops sampling
#[derive(Debug)]
pub struct ProbeHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl ProbeHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops sampling and returns how many samples were taken
    pub async fn stop(mut self) -> Result<u64> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.map_err(|e| {
            Error::pool(PoolOperation::Await, format!("Probe task failed: {}", e))
        })
    }
}
