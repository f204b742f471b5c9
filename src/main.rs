// src/main.rs - Command line entry point

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use qorzen_workpool::concurrency::{PoolLimits, PoolProbe};
use qorzen_workpool::config::ConfigManager;
use qorzen_workpool::error::Result;
use qorzen_workpool::{Manager, WorkPoolExt, WorkpoolApp};

#[derive(Parser)]
#[command(
    name = "qorzen-workpool",
    version = qorzen_workpool::VERSION,
    about = "Adaptive background worker pool",
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a burst of sleeping work items and report pool diagnostics
    Run {
        #[arg(long, default_value_t = 200)]
        items: u64,
        #[arg(long, default_value_t = 25)]
        sleep_ms: u64,
        #[arg(long, default_value_t = 250)]
        sample_ms: u64,
    },
    /// Print the effective pool sizing
    Limits,
    /// Validate configuration
    ValidateConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let outcome = match &cli.command {
        Some(Commands::Run {
            items,
            sleep_ms,
            sample_ms,
        }) => run_burst(&cli, *items, *sleep_ms, *sample_ms).await,
        Some(Commands::Limits) => show_limits(&cli).await,
        Some(Commands::ValidateConfig) => validate_config(&cli).await,
        None => run_burst(&cli, 200, 25, 250).await,
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn config_manager(cli: &Cli) -> Result<ConfigManager> {
    let mut config_manager = match &cli.config {
        Some(path) => ConfigManager::with_config_file(path)?,
        None => ConfigManager::new(),
    };

    if cli.verbose {
        config_manager.add_memory_layer(
            "cli",
            serde_json::json!({ "logging": { "level": "debug" } }),
            2000,
        );
    }
    Ok(config_manager)
}

async fn run_burst(cli: &Cli, items: u64, sleep_ms: u64, sample_ms: u64) -> Result<()> {
    let mut app = WorkpoolApp::with_config_manager(config_manager(cli)?);
    app.initialize().await?;

    let pool = app.pool()?;
    let probe = PoolProbe::new(Arc::clone(&pool), Duration::from_millis(sample_ms.max(1))).spawn();

    let executed = Arc::new(AtomicU64::new(0));
    for _ in 0..items {
        let executed = Arc::clone(&executed);
        pool.execute(move || {
            std::thread::sleep(Duration::from_millis(sleep_ms));
            executed.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    tracing::info!(items, peak_workers = pool.status().total_workers, "Burst submitted");

    let drained = async {
        while pool.status().completed_count < items {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::select! {
        _ = drained => tracing::info!("Burst drained"),
        _ = app.wait_for_shutdown() => tracing::warn!("Interrupted before the burst drained"),
    }

    let samples = probe.stop().await?;
    let status = pool.status();
    app.shutdown().await?;

    let report = serde_json::json!({
        "executed": executed.load(Ordering::Relaxed),
        "samples": samples,
        "status": status,
        "final": pool.status(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string())
    );
    Ok(())
}

async fn show_limits(cli: &Cli) -> Result<()> {
    let mut config_manager = config_manager(cli)?;
    config_manager.initialize().await?;

    let config = config_manager.get_config().await?;
    let limits = PoolLimits::resolve(&config.pool)?;

    println!("Pool kind:        {}", config.pool.kind);
    println!("Logical CPUs:     {}", limits.logical_cpus);
    println!("Minimum workers:  {}", limits.min_workers);
    println!("Maximum workers:  {}", limits.max_workers);
    println!("Growth batch:     {}", limits.growth_batch);
    println!("Idle timeout:     {:?}", limits.idle_timeout);
    println!("Wake timeout:     {:?}", limits.wake_timeout);
    println!("Shutdown timeout: {:?}", limits.shutdown_timeout);
    Ok(())
}

async fn validate_config(cli: &Cli) -> Result<()> {
    println!("Validating configuration...");

    let mut config_manager = config_manager(cli)?;
    config_manager.initialize().await?;
    let errors = config_manager.validate().await?;

    if errors.is_empty() {
        println!("Configuration is valid");
        println!("   Version: {}", qorzen_workpool::VERSION);
        return Ok(());
    }

    for error in &errors {
        println!("   {}", error);
    }
    process::exit(2);
}
