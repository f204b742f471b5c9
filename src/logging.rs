// src/logging.rs

//! Structured logging setup
//!
//! Installs the process-wide `tracing` subscriber:
//! - `EnvFilter` from `RUST_LOG`, falling back to the configured level
//! - Console output, colored or plain
//! - Optional daily-rolling file output in JSON, pretty or compact form
//! - A counting layer whose per-level totals are reported in the manager status

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, Identity};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, ResultExt};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// Totals of events that passed the filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStats {
    pub total_entries: u64,
    pub entries_by_level: HashMap<LogLevel, u64>,
}

/// Counts every event it sees, per level
#[derive(Debug, Clone, Default)]
struct StatsLayer {
    counts: Arc<[AtomicU64; 5]>,
}

impl StatsLayer {
    fn stats(&self) -> LogStats {
        let mut stats = LogStats::default();
        for level in LogLevel::ALL {
            let count = self.counts[level.index()].load(Ordering::Relaxed);
            stats.total_entries += count;
            if count > 0 {
                stats.entries_by_level.insert(level, count);
            }
        }
        stats
    }
}

impl<S> Layer<S> for StatsLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        self.counts[level.index()].fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct LoggingManager {
    state: ManagedState,
    config: LoggingConfig,
    stats_layer: StatsLayer,
    installed: bool,
    _guards: Vec<WorkerGuard>,
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "logging_manager"),
            config,
            stats_layer: StatsLayer::default(),
            installed: false,
            _guards: Vec::new(),
        }
    }

    /// Whether this manager's subscriber became the global default
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn stats(&self) -> LogStats {
        self.stats_layer.stats()
    }

    fn setup_tracing(&mut self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

        let registry = Registry::default().with(filter);

        let registry = if self.config.console.enabled {
            let console_layer = fmt::layer()
                .with_ansi(self.config.console.colored)
                .with_target(true)
                .with_thread_names(true);

            let console_layer = match self.config.format {
                LogFormat::Json => console_layer.json().boxed(),
                LogFormat::Pretty => console_layer.boxed(),
                LogFormat::Compact => console_layer.compact().boxed(),
            };
            registry.with(console_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        let registry = if let Some(file_config) = &self.config.file {
            let file_appender = tracing_appender::rolling::daily(
                file_config.path.parent().unwrap_or_else(|| Path::new(".")),
                file_config
                    .path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("workpool.log")),
            );

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            self._guards.push(guard);

            let file_layer = match self.config.format {
                LogFormat::Json => fmt::layer().json().with_writer(non_blocking).boxed(),
                LogFormat::Pretty => fmt::layer().pretty().with_ansi(false).with_writer(non_blocking).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_ansi(false).with_writer(non_blocking).boxed(),
            };
            registry.with(file_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        let registry = registry.with(self.stats_layer.clone());

        // Tests and embedding applications may have installed one already
        match registry.try_init() {
            Ok(()) => self.installed = true,
            Err(e) => tracing::debug!(error = %e, "Global tracing subscriber already set"),
        }
    }
}

#[async_trait]
impl Manager for LoggingManager {
    fn name(&self) -> &str {
        "logging_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        if let Some(file_config) = &self.config.file {
            if let Some(parent) = file_config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
            }
        }

        self.setup_tracing();

        self.state.set_state(ManagerState::Running).await;
        tracing::info!(level = %self.config.level, "Logging manager initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        tracing::info!("Shutting down logging manager");

        // Dropping the guards flushes the non-blocking file writers
        self._guards.clear();

        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata("total_entries", serde_json::Value::from(stats.total_entries));
        for (level, count) in &stats.entries_by_level {
            status.add_metadata(
                format!("{:?}_entries", level).to_lowercase(),
                serde_json::Value::from(*count),
            );
        }
        status.add_metadata("subscriber_installed", serde_json::Value::Bool(self.installed));
        status.add_metadata("file_logging", serde_json::Value::Bool(self.config.file.is_some()));
        status.add_metadata("console_logging", serde_json::Value::Bool(self.config.console.enabled));
        status.add_metadata("log_level", serde_json::Value::String(self.config.level.clone()));

        status
    }
}
