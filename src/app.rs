// src/app.rs - Application core wiring configuration, logging and the worker pool

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::concurrency::{ConcurrencyManager, WorkPool};
use crate::config::{AppConfig, ConfigManager};
use crate::error::{Error, ManagerOperation, Result};
use crate::logging::LoggingManager;
use crate::manager::{HealthStatus, ManagedState, Manager, ManagerState, ManagerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationHealth {
    pub status: HealthStatus,
    pub managers: HashMap<String, HealthStatus>,
}

/// Owns every manager and runs them in dependency order
pub struct WorkpoolApp {
    state: ManagedState,
    config_manager: ConfigManager,
    config: Option<AppConfig>,
    logging_manager: Option<LoggingManager>,
    concurrency_manager: Option<ConcurrencyManager>,
    shutdown_signal: broadcast::Sender<()>,
}

impl std::fmt::Debug for WorkpoolApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkpoolApp")
            .field("config_manager", &self.config_manager)
            .field("has_pool", &self.concurrency_manager.is_some())
            .finish()
    }
}

impl WorkpoolApp {
    pub fn new() -> Self {
        Self::with_config_manager(ConfigManager::new())
    }

    pub fn with_config_file(config_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_config_manager(ConfigManager::with_config_file(config_path)?))
    }

    pub fn with_config_manager(config_manager: ConfigManager) -> Self {
        let (shutdown_signal, _) = broadcast::channel(1);
        Self {
            state: ManagedState::new(Uuid::new_v4(), "workpool_app"),
            config_manager,
            config: None,
            logging_manager: None,
            concurrency_manager: None,
            shutdown_signal,
        }
    }

    /// Initializes configuration, then logging, then the pool
    pub async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        if let Err(e) = self.start_managers().await {
            self.state.set_state(ManagerState::Error).await;
            self.state.set_message(e.message.clone()).await;
            return Err(e);
        }

        self.setup_signal_handlers();
        self.state.set_state(ManagerState::Running).await;
        tracing::info!(version = crate::VERSION, "Workpool application started");
        Ok(())
    }

    async fn start_managers(&mut self) -> Result<()> {
        self.config_manager.initialize().await?;
        let config = self.config_manager.get_config().await?;
        config.pool.validate()?;

        let mut logging_manager = LoggingManager::new(config.logging.clone());
        logging_manager.initialize().await?;
        self.logging_manager = Some(logging_manager);

        let mut concurrency_manager = ConcurrencyManager::new(config.pool.clone());
        concurrency_manager.initialize().await?;
        self.concurrency_manager = Some(concurrency_manager);

        self.config = Some(config);
        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let shutdown_sender = self.shutdown_signal.clone();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received interrupt, requesting shutdown");
                    let _ = shutdown_sender.send(());
                }
                Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt signal"),
            }
        });
    }

    pub fn config(&self) -> Option<&AppConfig> {
        self.config.as_ref()
    }

    /// Pool handle to pass to collaborators
    pub fn pool(&self) -> Result<Arc<dyn WorkPool>> {
        match &self.concurrency_manager {
            Some(manager) => manager.pool(),
            None => Err(Error::manager(
                "workpool_app",
                ManagerOperation::Operation("pool".to_string()),
                "Application is not initialized",
            )),
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_signal.send(());
    }

    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut receiver = self.shutdown_signal.subscribe();
        receiver.recv().await.map_err(|_| {
            Error::manager(
                "workpool_app",
                ManagerOperation::Shutdown,
                "Shutdown signal channel closed unexpectedly",
            )
        })
    }

    /// Shuts managers down in reverse start order; the first error is returned
    /// after every manager has been given the chance to stop
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        let mut first_error = None;

        if let Some(mut manager) = self.concurrency_manager.take() {
            if let Err(e) = manager.shutdown().await {
                tracing::error!(error = %e, "Failed to shut down concurrency manager");
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut manager) = self.logging_manager.take() {
            if let Err(e) = manager.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.config_manager.shutdown().await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => {
                self.state.set_state(ManagerState::Error).await;
                Err(e)
            }
            None => {
                self.state.set_state(ManagerState::Shutdown).await;
                Ok(())
            }
        }
    }

    pub async fn get_health(&self) -> ApplicationHealth {
        let mut managers = HashMap::new();
        managers.insert(
            self.config_manager.name().to_string(),
            self.config_manager.health_check().await,
        );
        if let Some(manager) = &self.logging_manager {
            managers.insert(manager.name().to_string(), manager.health_check().await);
        }
        if let Some(manager) = &self.concurrency_manager {
            managers.insert(manager.name().to_string(), manager.health_check().await);
        }

        let status = if managers.is_empty() || managers.values().any(|h| *h == HealthStatus::Unknown) {
            HealthStatus::Unknown
        } else if managers.values().any(|h| *h == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if managers.values().any(|h| *h == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ApplicationHealth { status, managers }
    }
}

impl Default for WorkpoolApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for WorkpoolApp {
    fn name(&self) -> &str {
        "workpool_app"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        WorkpoolApp::initialize(self).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        WorkpoolApp::shutdown(self).await
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        if let Some(manager) = &self.concurrency_manager {
            let pool_status = manager.status().await;
            status.add_metadata("pool", serde_json::json!(pool_status.metadata));
        }
        status
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state.state().await {
            ManagerState::Running => self.get_health().await.status,
            ManagerState::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}
