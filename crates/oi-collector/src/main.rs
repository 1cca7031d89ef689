//! Open-interest collector - Entry Point

use anyhow::Result;
use clap::Parser;
use oi_collector::app::{spawn_signal_listener, stats_report};
use oi_collector::config::prune_symbols_in_file;
use oi_collector::{AppConfig, Application};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exchange open-interest collector
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via OI_CONFIG env var)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collect these symbols instead of the configured list
    #[arg(long, num_args = 1..)]
    symbols: Option<Vec<String>>,

    /// Collect sequentially once per minute for this many hours, then exit
    #[arg(long, conflicts_with_all = ["history_only", "once"])]
    hours: Option<f64>,

    /// Run only the history backfill for this many minutes, then exit
    #[arg(long, num_args = 0..=1, default_missing_value = "60", conflicts_with = "once")]
    history_only: Option<u64>,

    /// Run a single snapshot batch and exit
    #[arg(long)]
    once: bool,

    /// Print storage and error statistics, then exit
    #[arg(long)]
    stats: bool,

    /// Remove symbols recorded as invalid instruments from the config file
    #[arg(long)]
    prune_invalid: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI arg > OI_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("OI_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/default.toml"));

    let config_exists = config_path.exists();
    let mut config = if config_exists {
        AppConfig::from_file(&config_path)?
    } else {
        AppConfig::default().with_env_overrides()?
    };
    if let Some(symbols) = args.symbols {
        config.set_symbols(symbols);
    }

    oi_telemetry::init_logging(&config.telemetry.log_level)?;
    info!("Starting oi-collector v{}", env!("CARGO_PKG_VERSION"));
    if !config_exists {
        warn!(path = %config_path.display(), "Config file not found, using defaults");
    }

    if args.stats {
        println!("{}", stats_report(&config.data_dir)?);
        return Ok(());
    }

    if args.prune_invalid {
        let storage = oi_persistence::Storage::open(&config.data_dir)?;
        let invalid = oi_aggregator::ErrorAggregator::open(storage).invalid_symbols();
        if invalid.is_empty() {
            println!("No invalid symbols recorded");
        } else {
            let removed = prune_symbols_in_file(&config_path, &invalid)?;
            println!("Removed {} symbol(s): {}", removed.len(), removed.join(", "));
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let app = Application::new(config, shutdown)?;

    if args.once {
        let outcome = app.run_once().await;
        info!(
            succeeded = outcome.succeeded,
            processed = outcome.processed,
            failed = ?outcome.failed(),
            "Single batch finished"
        );
    } else if let Some(hours) = args.hours {
        app.run_for_hours(hours).await?;
    } else if let Some(minutes) = args.history_only {
        app.run_history_only(minutes).await?;
    } else {
        app.run().await?;
    }

    info!("Shutdown complete");
    Ok(())
}
