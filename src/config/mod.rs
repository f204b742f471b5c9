// src/config/mod.rs

//! Layered configuration for the worker pool
//!
//! This module provides the configuration system consumed at startup:
//! - Multiple configuration formats (YAML, JSON, TOML)
//! - Environment variable overrides (`QORZEN_POOL__MAX_THREADS_PER_CPU=16`)
//! - In-memory layers for embedding applications and tests
//! - Validation of the pool sizing rules
//!
//! Pool settings are read once when the pool is built; changing them later
//! has no effect on a running pool.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

/// Default environment prefix
pub const ENV_PREFIX: &str = "QORZEN";

/// Separator between nesting levels in environment variable names
pub const ENV_NESTING_SEPARATOR: &str = "__";

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub key: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation error for '{}': {}", self.key, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    File { path: PathBuf, format: ConfigFormat },
    Environment { prefix: String },
    Memory { data: Value },
}

#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub name: String,
    pub source: ConfigSource,
    pub priority: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub logging: LoggingConfig,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "Qorzen Workpool".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub console: ConsoleLogConfig,
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            console: ConsoleLogConfig::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleLogConfig {
    pub enabled: bool,
    pub colored: bool,
}

impl Default for ConsoleLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            colored: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogConfig {
    pub path: PathBuf,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/workpool.log"),
        }
    }
}

/// Which pool implementation `build_pool` creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Dedicated threads with reactive growth and self-retirement
    #[default]
    Adaptive,
    /// The runtime-provided blocking thread pool
    Native,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adaptive => write!(f, "adaptive"),
            Self::Native => write!(f, "native"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Worker floor; derived from the CPU count when unset
    pub min_workers: Option<usize>,
    /// Ceiling is `logical cpus * max_threads_per_cpu`
    pub max_threads_per_cpu: usize,
    /// Workers added per resize; defaults to the logical CPU count
    pub growth_batch: Option<usize>,
    pub idle_timeout_ms: u64,
    pub wake_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Overrides the detected logical CPU count
    pub cpu_count: Option<usize>,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::default(),
            min_workers: None,
            max_threads_per_cpu: 12,
            growth_batch: None,
            idle_timeout_ms: 60_000,
            wake_timeout_ms: 5_000,
            shutdown_timeout_ms: 30_000,
            cpu_count: None,
            thread_name_prefix: "qorzen-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    pub fn logical_cpus(&self) -> usize {
        self.cpu_count.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Small hosts get twice as many floor workers to stay responsive.
    ///
    /// A derived floor never exceeds the ceiling; an explicit one is taken as is.
    pub fn min_workers(&self) -> usize {
        self.min_workers.unwrap_or_else(|| {
            let cpus = self.logical_cpus();
            let floor = if cpus < 4 { cpus * 2 } else { cpus };
            floor.min(self.max_workers()).max(1)
        })
    }

    pub fn max_workers(&self) -> usize {
        self.logical_cpus().saturating_mul(self.max_threads_per_cpu)
    }

    pub fn growth_batch(&self) -> usize {
        self.growth_batch
            .unwrap_or_else(|| self.logical_cpus())
            .min(self.max_workers())
            .max(1)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Collects every rule violation instead of stopping at the first one.
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut reject = |key: &str, message: String| {
            errors.push(ValidationError {
                key: format!("pool.{}", key),
                message,
            })
        };

        if self.max_threads_per_cpu == 0 {
            reject("max_threads_per_cpu", "must be at least 1".to_string());
        }
        if self.min_workers == Some(0) {
            reject("min_workers", "must be at least 1".to_string());
        }
        if self.growth_batch == Some(0) {
            reject("growth_batch", "must be at least 1".to_string());
        }
        if self.cpu_count == Some(0) {
            reject("cpu_count", "must be at least 1".to_string());
        }
        if self.idle_timeout_ms == 0 {
            reject("idle_timeout_ms", "must be greater than zero".to_string());
        }
        if self.wake_timeout_ms == 0 {
            reject("wake_timeout_ms", "must be greater than zero".to_string());
        }
        if self.thread_name_prefix.is_empty() {
            reject("thread_name_prefix", "must not be empty".to_string());
        }
        if self.max_threads_per_cpu > 0 && self.min_workers() > self.max_workers() {
            reject(
                "min_workers",
                format!(
                    "floor of {} exceeds ceiling of {} ({} cpus x {})",
                    self.min_workers(),
                    self.max_workers(),
                    self.logical_cpus(),
                    self.max_threads_per_cpu
                ),
            );
        }

        errors
    }

    pub fn validate(&self) -> Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            return Ok(());
        }

        let key = errors[0].key.clone();
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        Err(Error::config_key(
            key,
            messages.clone(),
            format!("Invalid pool configuration: {}", messages.join("; ")),
        ))
    }
}

pub struct ConfigManager {
    state: ManagedState,
    layers: Vec<ConfigLayer>,
    merged_config: Arc<RwLock<Value>>,
    env_prefix: String,
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("layers", &self.layers.len())
            .field("env_prefix", &self.env_prefix)
            .finish()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::with_env_prefix(ENV_PREFIX)
    }

    pub fn with_env_prefix(prefix: impl Into<String>) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "config_manager"),
            layers: Vec::new(),
            merged_config: Arc::new(RwLock::new(Value::Object(Map::new()))),
            env_prefix: prefix.into(),
        }
    }

    pub fn with_config_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut manager = Self::new();
        manager.add_file_layer("default", config_path, 0)?;
        Ok(manager)
    }

    pub fn add_file_layer<P: AsRef<Path>>(
        &mut self,
        name: impl Into<String>,
        path: P,
        priority: u32,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let format = ConfigFormat::from_extension(&path).ok_or_else(|| {
            Error::config(format!(
                "Unsupported configuration file format: {}",
                path.display()
            ))
        })?;

        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::File { path, format },
            priority,
        });
        Ok(())
    }

    pub fn add_env_layer(&mut self, name: impl Into<String>, prefix: impl Into<String>, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Environment {
                prefix: prefix.into(),
            },
            priority,
        });
    }

    pub fn add_memory_layer(&mut self, name: impl Into<String>, data: Value, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Memory { data },
            priority,
        });
    }

    fn push_layer(&mut self, layer: ConfigLayer) {
        self.layers.push(layer);
        self.layers.sort_by_key(|l| l.priority);
    }

    pub async fn set<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: Serialize,
    {
        let serialized_value = serde_json::to_value(value).map_err(|e| {
            Error::config_key(
                key,
                vec![format!("Failed to serialize config value: {}", e)],
                format!("Failed to serialize config value: {}", e),
            )
        })?;

        let mut config = self.merged_config.write().await;
        set_nested_value(&mut config, key, serialized_value);
        Ok(())
    }

    pub async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.merged_config.read().await;
        let value = get_nested_value(&config, key).ok_or_else(|| {
            Error::config_key(
                key,
                vec![format!("Configuration key '{}' not found", key)],
                "Configuration key not found",
            )
        })?;

        serde_json::from_value(value).map_err(|e| {
            Error::config_key(
                key,
                vec![format!("Failed to deserialize config value: {}", e)],
                format!("Failed to deserialize config value: {}", e),
            )
        })
    }

    pub async fn get_config(&self) -> Result<AppConfig> {
        let config = self.merged_config.read().await;
        serde_json::from_value(config.clone()).map_err(|e| {
            Error::config(format!("Failed to deserialize application config: {}", e))
                .source("config_manager")
        })
    }

    pub async fn reload(&self) -> Result<()> {
        self.merge_configurations().await
    }

    pub async fn validate(&self) -> Result<Vec<ValidationError>> {
        let config = self.get_config().await?;
        Ok(config.pool.validation_errors())
    }

    async fn merge_configurations(&self) -> Result<()> {
        let mut merged = Value::Object(Map::new());

        // Lowest priority first so later layers win
        for layer in &self.layers {
            let layer_config = load_layer_config(layer)?;
            merge_values(&mut merged, layer_config);
        }

        *self.merged_config.write().await = merged;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn load_layer_config(layer: &ConfigLayer) -> Result<Value> {
    match &layer.source {
        ConfigSource::File { path, format } => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

            match format {
                ConfigFormat::Json => serde_json::from_str(&content)
                    .map_err(|e| Error::config(format!("Failed to parse JSON config: {}", e))),
                ConfigFormat::Yaml => serde_yaml::from_str(&content)
                    .map_err(|e| Error::config(format!("Failed to parse YAML config: {}", e))),
                ConfigFormat::Toml => toml::from_str(&content)
                    .map_err(|e| Error::config(format!("Failed to parse TOML config: {}", e))),
            }
        }
        ConfigSource::Environment { prefix } => Ok(env_layer_from(prefix, std::env::vars())),
        ConfigSource::Memory { data } => Ok(data.clone()),
    }
}

/// Builds a config tree from `PREFIX_SECTION__KEY=value` pairs.
fn env_layer_from(prefix: &str, vars: impl Iterator<Item = (String, String)>) -> Value {
    let mut env_config = Map::new();

    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('_') else {
            continue;
        };

        let config_key = rest.to_lowercase();
        let nested_keys: Vec<&str> = config_key
            .split(ENV_NESTING_SEPARATOR)
            .filter(|k| !k.is_empty())
            .collect();
        set_nested_env_value(&mut env_config, &nested_keys, value);
    }

    Value::Object(env_config)
}

fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(&key) {
                    Some(target_value) => merge_values(target_value, source_value),
                    None => {
                        target_map.insert(key, source_value);
                    }
                }
            }
        }
        (target, source) => {
            *target = source;
        }
    }
}

fn get_nested_value(config: &Value, key: &str) -> Option<Value> {
    let mut current = config;
    for k in key.split('.') {
        current = current.get(k)?;
    }
    Some(current.clone())
}

fn set_nested_value(config: &mut Value, key: &str, value: Value) {
    let keys: Vec<&str> = key.split('.').collect();
    let (last, parents) = match keys.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut current = config;
    for k in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(k.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn set_nested_env_value(config: &mut Map<String, Value>, keys: &[&str], value: String) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };

    if rest.is_empty() {
        config.insert(first.to_string(), parse_env_value(value));
        return;
    }

    let entry = config
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(nested_map) = entry {
        set_nested_env_value(nested_map, rest, value);
    }
}

fn parse_env_value(value: String) -> Value {
    if let Ok(bool_val) = value.parse::<bool>() {
        Value::Bool(bool_val)
    } else if let Ok(int_val) = value.parse::<i64>() {
        Value::Number(Number::from(int_val))
    } else if let Some(float_val) = value.parse::<f64>().ok().and_then(Number::from_f64) {
        Value::Number(float_val)
    } else {
        Value::String(value)
    }
}

#[async_trait]
impl Manager for ConfigManager {
    fn name(&self) -> &str {
        "config_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        let env_prefix = self.env_prefix.clone();
        self.add_env_layer("environment", env_prefix, 1000);

        if let Err(e) = self.merge_configurations().await {
            self.state.set_state(ManagerState::Error).await;
            return Err(e);
        }

        self.state.set_state(ManagerState::Running).await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        status.add_metadata("layers", Value::from(self.layers.len()));
        status.add_metadata("env_prefix", Value::String(self.env_prefix.clone()));
        status
    }
}
