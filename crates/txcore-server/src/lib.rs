//! # txcore-server
//!
//! The txcored daemon for the txcore transaction core.
//!
//! This crate provides:
//!
//! - **Configuration**: A TOML file format embedding the core's
//!   configuration sections, with command-line overrides.
//!
//! - **Daemon Runtime**: Recovery at startup, periodic vacuum and status
//!   logging on tokio intervals, and a graceful shutdown that rolls back
//!   live transactions and closes the WAL.
//!
//! # Quick Start
//!
//! ```ignore
//! use txcore_server::{Daemon, ServerConfig};
//!
//! let config = ServerConfig::builder().data_dir("/var/lib/txcore").build();
//! let daemon = Daemon::open(config)?;
//! println!("{}", daemon.status_json()?);
//! daemon.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Server configuration.
pub mod config;

/// Daemon runtime: recovery, periodic tasks and shutdown.
pub mod daemon;

// Re-export commonly used types
pub use config::{ServerConfig, ServerConfigBuilder};
pub use daemon::Daemon;
