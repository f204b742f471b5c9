// src/lib.rs

//! Qorzen Workpool - an adaptive background worker pool with async lifecycle managers

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::result_large_err)]

pub mod app;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod types;

// Re-export commonly used types
pub use app::WorkpoolApp;
pub use concurrency::{build_pool, PoolStatus, ShutdownReport, WorkPool, WorkPoolExt};
pub use config::{AppConfig, ConfigManager, PoolConfig, PoolKind};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use manager::{Manager, ManagerState, ManagerStatus};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
