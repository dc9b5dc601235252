//! txcore Daemon
//!
//! The `txcored` binary hosts the transaction core:
//! - Recovers committed work from the WAL directory
//! - Runs the deadlock detector, periodic vacuum and status logging
//! - Rolls back live transactions and closes the WAL on SIGTERM/SIGINT
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! txcored run
//!
//! # Start with a custom data directory
//! txcored run --data-dir /var/lib/txcore
//!
//! # Print the status of a WAL directory as JSON
//! txcored status --wal-dir /var/lib/txcore/wal
//!
//! # Print the effective configuration
//! txcored config --config /etc/txcore/txcored.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use txcore_server::{Daemon, ServerConfig};

/// txcore Daemon
#[derive(Parser, Debug)]
#[command(
    name = "txcored",
    version,
    about = "txcore transaction core daemon",
    long_about = "txcore provides locking, deadlock detection, MVCC snapshots and a \
                  write-ahead log.\n\n\
                  This daemon recovers the WAL and hosts the transaction core."
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", global = true, env = "TXCORE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for persistent state
    #[arg(short = 'd', long, value_name = "DIR", global = true, env = "TXCORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// WAL directory (defaults to data_dir/wal)
    #[arg(long, value_name = "DIR", global = true, env = "TXCORE_WAL_DIR")]
    wal_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "TXCORE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover the WAL and serve until interrupted
    Run,
    /// Recover the WAL and print the core status as JSON
    Status,
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    match args.command {
        Command::Config => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Status => {
            init_logging(&args, &config, "warn");
            print_status(config).await
        }
        Command::Run => {
            init_logging(&args, &config, &config.log_level);
            run_daemon(config).await
        }
    }
}

fn init_logging(args: &Args, config: &ServerConfig, default_level: &str) {
    let level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(default_level)
    };

    let filter = EnvFilter::try_new(format!(
        "txcore_server={level},txcore_txn={level},txcore_mvcc={level},txcore_wal={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    // Start with defaults
    let mut config = if let Some(path) = &args.config {
        ServerConfig::from_file(path).context("Failed to load config file")?
    } else {
        ServerConfig::default()
    };

    // Override with command-line arguments
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }

    if let Some(dir) = &args.wal_dir {
        config.wal_dir = Some(dir.clone());
    }

    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    Ok(config)
}

async fn print_status(mut config: ServerConfig) -> Result<()> {
    config.core.deadlock.enabled = false;
    config.core.mvcc.auto_vacuum = false;
    let daemon = tokio::task::spawn_blocking(move || Daemon::open(config))
        .await
        .context("recovery task panicked")??;

    println!("{}", daemon.status_json()?);
    daemon.run_until(async {}).await
}

async fn run_daemon(config: ServerConfig) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!("txcored v{} starting", version);

    let daemon = tokio::task::spawn_blocking(move || Daemon::open(config))
        .await
        .context("recovery task panicked")??;

    let config = daemon.config();
    info!("Server configuration:");
    info!("  WAL directory: {}", config.effective_wal_dir().display());
    info!("  Lock timeout: {:?}", config.core.lock.timeout);
    info!(
        "  Deadlock detection: {} (every {:?})",
        config.core.deadlock.enabled, config.core.deadlock.interval
    );
    info!(
        "  Auto vacuum: {} (every {:?})",
        config.core.mvcc.auto_vacuum, config.core.mvcc.vacuum_interval
    );
    info!("  Default isolation: {}", config.core.txn.default_isolation);
    info!("Press Ctrl+C to shutdown");

    daemon.run_until(shutdown_signal()).await?;

    info!("Server stopped. Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
